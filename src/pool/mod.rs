//! Backend Pool (spec.md §4.D).
//!
//! One pool per shard: a primary address plus zero or more replicas, with a
//! periodic TCP health probe and a round-robin replica selector. Reload
//! swaps the primary/replica lists atomically while preserving previously
//! observed health for addresses that didn't change, grounded on the
//! teacher's `redis/health` poller/evaluator split and its `ArcSwap`-backed
//! hot-swap pattern.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single backend address with an independently tracked health bit.
struct ReplicaSlot {
    addr: SocketAddr,
    healthy: AtomicBool,
}

struct PoolState {
    primary: SocketAddr,
    replicas: Vec<Arc<ReplicaSlot>>,
}

/// One shard's view of its primary and replicas. `GetReplica`/`GetPrimary`
/// never block; health and rotation are read under atomics or a brief
/// `ArcSwap` load.
pub struct BackendPool {
    shard_name: String,
    state: ArcSwap<PoolState>,
    rr_counter: AtomicUsize,
    probe_interval: Duration,
}

impl BackendPool {
    pub fn new(shard_name: String, primary: SocketAddr, replicas: Vec<SocketAddr>, probe_interval: Duration) -> Arc<Self> {
        let replicas = replicas
            .into_iter()
            .map(|addr| {
                Arc::new(ReplicaSlot {
                    addr,
                    healthy: AtomicBool::new(true),
                })
            })
            .collect();
        Arc::new(Self {
            shard_name,
            state: ArcSwap::from_pointee(PoolState { primary, replicas }),
            rr_counter: AtomicUsize::new(0),
            probe_interval,
        })
    }

    pub fn primary(&self) -> SocketAddr {
        self.state.load().primary
    }

    /// Stable round-robin across sequential calls among currently healthy
    /// replicas; falls back to the primary if none are healthy.
    pub fn replica(&self) -> SocketAddr {
        self.replica_with_index().0
    }

    /// Like `replica`, but also returns the chosen replica's position in
    /// the full (not just healthy) configured list, for the
    /// `replicas[i]` metrics label (spec.md §4.G).
    pub fn replica_with_index(&self) -> (SocketAddr, Option<usize>) {
        let state = self.state.load();
        let healthy: Vec<(usize, &Arc<ReplicaSlot>)> = state
            .replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.healthy.load(Ordering::Relaxed))
            .collect();
        if healthy.is_empty() {
            return (state.primary, None);
        }
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let (full_idx, slot) = healthy[idx];
        (slot.addr, Some(full_idx))
    }

    /// Atomically replace the primary/replica lists, preserving health bits
    /// for replica addresses that are unchanged; addresses that disappeared
    /// are simply dropped (spec.md §4.D).
    pub fn reload(&self, primary: SocketAddr, replicas: Vec<SocketAddr>) {
        let old = self.state.load();
        let old_health: HashMap<SocketAddr, bool> = old
            .replicas
            .iter()
            .map(|r| (r.addr, r.healthy.load(Ordering::Relaxed)))
            .collect();

        let new_replicas = replicas
            .into_iter()
            .map(|addr| {
                let healthy = old_health.get(&addr).copied().unwrap_or(true);
                Arc::new(ReplicaSlot {
                    addr,
                    healthy: AtomicBool::new(healthy),
                })
            })
            .collect();

        self.state.store(Arc::new(PoolState {
            primary,
            replicas: new_replicas,
        }));
    }

    /// Spawn the periodic TCP health-probe loop for this pool's replicas.
    /// Runs until `cancel` fires. Grounded on the teacher's
    /// `redis/health/poller.rs` probe-on-interval loop.
    pub fn spawn_health_probe(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.probe_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.probe_once().await,
                }
            }
        });
    }

    async fn probe_once(&self) {
        let replicas = self.state.load().replicas.clone();
        for slot in replicas.iter() {
            let healthy = probe_tcp(slot.addr).await;
            let was_healthy = slot.healthy.swap(healthy, Ordering::Relaxed);
            if was_healthy != healthy {
                if healthy {
                    debug!(shard = %self.shard_name, addr = %slot.addr, "replica became healthy");
                } else {
                    warn!(shard = %self.shard_name, addr = %slot.addr, "replica became unhealthy");
                }
            }
        }
    }
}

async fn probe_tcp(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Registry of per-shard pools, keyed by shard name.
pub struct PoolRegistry {
    pools: HashMap<String, Arc<BackendPool>>,
}

impl PoolRegistry {
    pub fn new(pools: HashMap<String, Arc<BackendPool>>) -> Self {
        Self { pools }
    }

    pub fn get(&self, shard_name: &str) -> Option<Arc<BackendPool>> {
        self.pools.get(shard_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn replica_falls_back_to_primary_when_none_healthy() {
        let pool = BackendPool::new(
            "shard1".into(),
            addr(1),
            vec![addr(2), addr(3)],
            Duration::from_secs(2),
        );
        for slot in pool.state.load().replicas.iter() {
            slot.healthy.store(false, Ordering::Relaxed);
        }
        assert_eq!(pool.replica(), addr(1));
    }

    #[test]
    fn replica_round_robins_across_healthy_set() {
        let pool = BackendPool::new(
            "shard1".into(),
            addr(1),
            vec![addr(2), addr(3)],
            Duration::from_secs(2),
        );
        let picks: Vec<SocketAddr> = (0..4).map(|_| pool.replica()).collect();
        assert_eq!(picks, vec![addr(2), addr(3), addr(2), addr(3)]);
    }

    #[test]
    fn reload_preserves_health_for_unchanged_addresses() {
        let pool = BackendPool::new(
            "shard1".into(),
            addr(1),
            vec![addr(2), addr(3)],
            Duration::from_secs(2),
        );
        pool.state.load().replicas[0].healthy.store(false, Ordering::Relaxed);

        pool.reload(addr(1), vec![addr(2), addr(4)]);

        let state = pool.state.load();
        let r2 = state.replicas.iter().find(|r| r.addr == addr(2)).unwrap();
        let r4 = state.replicas.iter().find(|r| r.addr == addr(4)).unwrap();
        assert!(!r2.healthy.load(Ordering::Relaxed));
        assert!(r4.healthy.load(Ordering::Relaxed));
        assert!(state.replicas.iter().all(|r| r.addr != addr(3)));
    }
}
