//! The TTL cache engine (spec.md §4.B).
//!
//! Stores opaque byte-exact result frames keyed by a cache key (query text,
//! optionally plus raw parameter bytes for prepared executes). Guarantees at
//! most one concurrent backend fetch per cold key, and exactly one refresh
//! token per stale transition.
//!
//! Sharded internally (spec.md §5) to keep unrelated keys from contending on
//! the same lock; each shard guards its own `HashMap` plus an approximate,
//! byte-budgeted LRU eviction policy.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const SHARD_COUNT: usize = 32;

/// Staleness classification of a present entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    /// `now < SoftExpiry`.
    Fresh = 0,
    /// `SoftExpiry <= now < HardExpiry`, and someone else already claimed
    /// the refresh for this transition.
    Stale = 1,
    /// The first stale reader since the last `Set`/hard-expiry: this
    /// reader is elected to perform the background refresh.
    RefreshToken = 3,
}

/// Outcome of a plain `get`.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub value: Option<Bytes>,
    pub flag: CacheFlag,
}

impl CacheLookup {
    fn absent() -> Self {
        Self {
            value: None,
            flag: CacheFlag::Fresh,
        }
    }

    pub fn present(&self) -> bool {
        self.value.is_some()
    }
}

/// Outcome of `get_or_wait`.
#[derive(Debug, Clone)]
pub struct GetOrWaitResult {
    pub value: Option<Bytes>,
    pub flag: CacheFlag,
    pub waited: bool,
    /// `true` iff this caller registered the in-flight slot and is now
    /// obligated to call `set_and_notify` or `cancel`.
    pub is_producer: bool,
}

impl GetOrWaitResult {
    pub fn present(&self) -> bool {
        self.value.is_some()
    }
}

struct StoredEntry {
    value: Bytes,
    soft_expiry: Instant,
    hard_expiry: Instant,
    refresh_claimed: bool,
    last_used: Instant,
    size: usize,
}

#[derive(Default)]
struct ShardState {
    entries: HashMap<Vec<u8>, StoredEntry>,
    inflight: HashMap<Vec<u8>, Arc<Notify>>,
    total_bytes: u64,
}

struct Shard {
    state: Mutex<ShardState>,
}

pub struct CacheEngine {
    shards: Vec<Shard>,
    max_bytes_per_shard: u64,
    stale_multiplier: f64,
}

impl CacheEngine {
    pub fn new(max_bytes: u64, stale_multiplier: f64) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                state: Mutex::new(ShardState::default()),
            })
            .collect();
        Self {
            shards,
            max_bytes_per_shard: (max_bytes / SHARD_COUNT as u64).max(1),
            stale_multiplier: stale_multiplier.max(1.0),
        }
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[fnv1a(key) as usize % self.shards.len()]
    }

    /// Probe a key without registering an in-flight fetch.
    pub fn get(&self, key: &[u8]) -> CacheLookup {
        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");
        classify_and_touch(&mut state, key)
    }

    /// Atomic probe-or-register (spec.md §4.B GetOrWait).
    ///
    /// If present, behaves like `get`. Otherwise, if another caller already
    /// registered an in-flight fetch, waits for it to finish and re-probes.
    /// If nobody has registered one, registers the caller as the producer.
    pub async fn get_or_wait(&self, key: &[u8]) -> GetOrWaitResult {
        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");
        let lookup = classify_and_touch(&mut state, key);
        if lookup.present() {
            return GetOrWaitResult {
                value: lookup.value,
                flag: lookup.flag,
                waited: false,
                is_producer: false,
            };
        }

        let notify = match state.inflight.get(key) {
            Some(existing) => existing.clone(),
            None => {
                let notify = Arc::new(Notify::new());
                state.inflight.insert(key.to_vec(), notify);
                return GetOrWaitResult {
                    value: None,
                    flag: CacheFlag::Fresh,
                    waited: false,
                    is_producer: true,
                };
            }
        };

        // Register as a waiter on `notify` while the shard lock is still
        // held, so a `wake()` that's blocked on the same lock cannot run
        // (and call `notify_waiters`) until after we're registered to
        // receive it. `Notify::notify_waiters` stores no permit: a waiter
        // that only calls `.notified().await` after dropping the lock can
        // miss a wake that lands in the gap and wait forever.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(state);

        notified.await;

        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");
        let lookup = classify_and_touch(&mut state, key);
        GetOrWaitResult {
            value: lookup.value,
            flag: lookup.flag,
            waited: true,
            is_producer: false,
        }
    }

    /// Insert the fetched value (if cacheable) and wake any waiters
    /// registered against this key's in-flight slot.
    pub fn set_and_notify(&self, key: &[u8], value: Bytes, ttl_secs: u64) {
        if ttl_secs > 0 {
            self.set(key, value, ttl_secs);
        }
        self.wake(key);
    }

    /// Wake waiters without inserting anything; they observe `present=false`.
    pub fn cancel(&self, key: &[u8]) {
        self.wake(key);
    }

    fn wake(&self, key: &[u8]) {
        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");
        if let Some(notify) = state.inflight.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Unconditional store, used by the refresh path and by tests.
    pub fn set(&self, key: &[u8], value: Bytes, ttl_secs: u64) {
        let now = Instant::now();
        let soft_expiry = now + Duration::from_secs(ttl_secs);
        let hard_expiry = now + Duration::from_secs_f64(ttl_secs as f64 * self.stale_multiplier);
        let size = key.len() + value.len();

        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");

        if let Some(old) = state.entries.remove(key) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size as u64);
        }

        state.entries.insert(
            key.to_vec(),
            StoredEntry {
                value,
                soft_expiry,
                hard_expiry,
                refresh_claimed: false,
                last_used: now,
                size,
            },
        );
        state.total_bytes += size as u64;

        evict_if_needed(&mut state, self.max_bytes_per_shard);
    }

    /// Unconditional removal.
    pub fn delete(&self, key: &[u8]) {
        let shard = self.shard_for(key);
        let mut state = shard.state.lock().expect("cache shard mutex poisoned");
        if let Some(old) = state.entries.remove(key) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size as u64);
        }
    }

    #[cfg(test)]
    fn inflight_count(&self, key: &[u8]) -> usize {
        let shard = self.shard_for(key);
        let state = shard.state.lock().unwrap();
        if state.inflight.contains_key(key) { 1 } else { 0 }
    }
}

fn classify_and_touch(state: &mut ShardState, key: &[u8]) -> CacheLookup {
    let now = Instant::now();
    let Some(entry) = state.entries.get_mut(key) else {
        return CacheLookup::absent();
    };

    if now >= entry.hard_expiry {
        let size = entry.size;
        state.entries.remove(key);
        state.total_bytes = state.total_bytes.saturating_sub(size as u64);
        return CacheLookup::absent();
    }

    entry.last_used = now;

    if now < entry.soft_expiry {
        return CacheLookup {
            value: Some(entry.value.clone()),
            flag: CacheFlag::Fresh,
        };
    }

    let flag = if entry.refresh_claimed {
        CacheFlag::Stale
    } else {
        entry.refresh_claimed = true;
        CacheFlag::RefreshToken
    };

    CacheLookup {
        value: Some(entry.value.clone()),
        flag,
    }
}

/// Approximate LRU: evict oldest-accessed entries until under budget. This
/// is the "LRU-equivalent acceptable" policy named in spec.md §3.
fn evict_if_needed(state: &mut ShardState, max_bytes: u64) {
    while state.total_bytes > max_bytes {
        let oldest_key = state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());

        let Some(key) = oldest_key else { break };
        if let Some(entry) = state.entries.remove(&key) {
            state.total_bytes = state.total_bytes.saturating_sub(entry.size as u64);
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn fresh_hit_returns_value() {
        let cache = CacheEngine::new(1024 * 1024, 2.0);
        cache.set(b"k1", Bytes::from_static(b"v1"), 60);
        let lookup = cache.get(b"k1");
        assert!(lookup.present());
        assert_eq!(lookup.flag, CacheFlag::Fresh);
        assert_eq!(lookup.value.unwrap(), Bytes::from_static(b"v1"));
    }

    #[test]
    fn ttl_zero_is_never_cached() {
        let cache = CacheEngine::new(1024, 2.0);
        cache.set(b"k1", Bytes::from_static(b"v1"), 0);
        assert!(!cache.get(b"k1").present());
    }

    #[test]
    fn hard_expired_entry_is_absent() {
        let cache = CacheEngine::new(1024, 1.0);
        // stale_multiplier clamps to >=1.0, so soft==hard here with ttl=0s.
        cache.set(b"k1", Bytes::from_static(b"v1"), 0);
        assert!(!cache.get(b"k1").present());
    }

    #[tokio::test]
    async fn cold_miss_single_flight_registers_exactly_one_producer() {
        let cache = StdArc::new(CacheEngine::new(1024 * 1024, 2.0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_or_wait(b"key").await }));
        }

        // Give all tasks a chance to race into get_or_wait.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.inflight_count(b"key"), 1);

        let mut producers = 0;
        let mut results = Vec::new();
        for h in handles {
            let r = h.await.unwrap();
            if r.is_producer {
                producers += 1;
            }
            results.push(r);
        }
        // Exactly one producer may have already returned before others
        // joined the in-flight slot; assert the invariant directly.
        assert_eq!(producers, 1);
    }

    #[tokio::test]
    async fn waiters_observe_producer_result() {
        let cache = StdArc::new(CacheEngine::new(1024 * 1024, 2.0));
        let first = cache.get_or_wait(b"k").await;
        assert!(first.is_producer);
        assert!(!first.present());

        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move { cache2.get_or_wait(b"k").await });
        sleep(Duration::from_millis(20)).await;

        cache.set_and_notify(b"k", Bytes::from_static(b"result"), 30);

        let waited = waiter.await.unwrap();
        assert!(waited.waited);
        assert!(waited.present());
        assert_eq!(waited.value.unwrap(), Bytes::from_static(b"result"));
    }

    #[tokio::test]
    async fn waiter_does_not_miss_a_wake_that_lands_immediately() {
        // No sleep between spawning the waiter and notifying: the waiter
        // task may not reach its first `.await` inside `get_or_wait` before
        // this task calls `set_and_notify`. If the `Notified` future isn't
        // registered until after the shard lock is released, this hangs.
        let cache = StdArc::new(CacheEngine::new(1024 * 1024, 2.0));
        let first = cache.get_or_wait(b"k").await;
        assert!(first.is_producer);

        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move { cache2.get_or_wait(b"k").await });

        cache.set_and_notify(b"k", Bytes::from_static(b"result"), 30);

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("get_or_wait must not hang on a wake that races the waiter's registration")
            .unwrap();
        assert!(waited.present());
        assert_eq!(waited.value.unwrap(), Bytes::from_static(b"result"));
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_with_absent_result() {
        let cache = StdArc::new(CacheEngine::new(1024 * 1024, 2.0));
        let first = cache.get_or_wait(b"k").await;
        assert!(first.is_producer);

        let cache2 = cache.clone();
        let waiter = tokio::spawn(async move { cache2.get_or_wait(b"k").await });
        sleep(Duration::from_millis(20)).await;

        cache.cancel(b"k");

        let waited = waiter.await.unwrap();
        assert!(!waited.present());
    }

    #[tokio::test]
    async fn refresh_token_delivered_to_exactly_one_stale_reader() {
        let cache = StdArc::new(CacheEngine::new(1024 * 1024, 1_000_000.0));
        // ttl of 0 whole seconds can't go stale in a test-friendly window, so
        // insert directly with a soft expiry in the past via a 0s ttl and a
        // large stale_multiplier, then sleep past it using a 1s ttl instead.
        cache.set(b"k", Bytes::from_static(b"v"), 1);
        sleep(Duration::from_millis(1100)).await;

        let mut tokens = 0;
        let mut stale = 0;
        for _ in 0..10 {
            let lookup = cache.get(b"k");
            assert!(lookup.present());
            match lookup.flag {
                CacheFlag::RefreshToken => tokens += 1,
                CacheFlag::Stale => stale += 1,
                CacheFlag::Fresh => panic!("unexpected fresh flag"),
            }
        }
        assert_eq!(tokens, 1);
        assert_eq!(stale, 9);
    }

    #[test]
    fn eviction_keeps_shard_under_budget() {
        // Tiny budget forces eviction almost immediately.
        let cache = CacheEngine::new(SHARD_COUNT as u64 * 16, 2.0);
        for i in 0..100u32 {
            let key = format!("key-{i}");
            cache.set(key.as_bytes(), Bytes::from(vec![0u8; 8]), 60);
        }
        let total: u64 = cache
            .shards
            .iter()
            .map(|s| s.state.lock().unwrap().total_bytes)
            .sum();
        assert!(total <= cache.max_bytes_per_shard * SHARD_COUNT as u64);
    }
}
