//! Shared, per-process proxy context: the cache engine, the pool registry,
//! the metrics sink, and lazily-constructed per-shard write-batch engines —
//! everything the MariaDB and PostgreSQL front ends both depend on.
//!
//! One `WriteBatchEngine` per `(protocol, shard)` pair is built the first
//! time a batchable write is seen for that shard, using the backend
//! credentials captured from whichever client connection triggers it
//! (spec.md §4.E handshake invariant: "the user's credentials must be
//! identical across shards").

use crate::batch::WriteBatchEngine;
use crate::cache::CacheEngine;
use crate::config::Config;
use crate::mariadb::executor::{AuthReplay, MariaDbBatchExecutor};
use crate::metrics::MetricsSink;
use crate::pool::PoolRegistry;
use crate::postgres::executor::{PostgresBatchExecutor, StartupReplay};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ProxyContext {
    pub config: Arc<Config>,
    pub pools: Arc<PoolRegistry>,
    pub cache: Arc<CacheEngine>,
    pub metrics: Arc<dyn MetricsSink>,
    /// Cancelled on graceful shutdown; every in-flight `Enqueue` honors it
    /// (spec.md §5 Cancellation and timeouts).
    pub shutdown: CancellationToken,

    mariadb_batch_engines: Mutex<HashMap<String, Arc<WriteBatchEngine>>>,
    postgres_batch_engines: Mutex<HashMap<String, Arc<WriteBatchEngine>>>,
}

impl ProxyContext {
    pub fn new(
        config: Arc<Config>,
        pools: Arc<PoolRegistry>,
        cache: Arc<CacheEngine>,
        metrics: Arc<dyn MetricsSink>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pools,
            cache,
            metrics,
            shutdown,
            mariadb_batch_engines: Mutex::new(HashMap::new()),
            postgres_batch_engines: Mutex::new(HashMap::new()),
        })
    }

    pub fn mariadb_batch_engine(
        &self,
        shard: &str,
        primary_addr: SocketAddr,
        auth: AuthReplay,
    ) -> Arc<WriteBatchEngine> {
        let mut map = self
            .mariadb_batch_engines
            .lock()
            .expect("batch engine map mutex poisoned");
        map.entry(shard.to_string())
            .or_insert_with(|| {
                let executor = Arc::new(MariaDbBatchExecutor::new(primary_addr, auth));
                WriteBatchEngine::with_hard_timeout(
                    executor,
                    self.metrics.clone(),
                    self.config.batch.max_batch_size,
                    Duration::from_millis(self.config.batch.drain_grace_ms),
                    Duration::from_millis(self.config.batch.max_wait_ms),
                )
            })
            .clone()
    }

    pub fn postgres_batch_engine(
        &self,
        shard: &str,
        primary_addr: SocketAddr,
        startup: StartupReplay,
    ) -> Arc<WriteBatchEngine> {
        let mut map = self
            .postgres_batch_engines
            .lock()
            .expect("batch engine map mutex poisoned");
        map.entry(shard.to_string())
            .or_insert_with(|| {
                let executor = Arc::new(PostgresBatchExecutor::new(primary_addr, startup));
                WriteBatchEngine::with_hard_timeout(
                    executor,
                    self.metrics.clone(),
                    self.config.batch.max_batch_size,
                    Duration::from_millis(self.config.batch.drain_grace_ms),
                    Duration::from_millis(self.config.batch.max_wait_ms),
                )
            })
            .clone()
    }

    /// Drain every per-shard batch engine during graceful shutdown
    /// (spec.md §5 Close semantics).
    pub async fn close_batch_engines(&self) {
        self.shutdown.cancel();
        let engines: Vec<Arc<WriteBatchEngine>> = {
            let m = self.mariadb_batch_engines.lock().expect("poisoned");
            let p = self.postgres_batch_engines.lock().expect("poisoned");
            m.values().chain(p.values()).cloned().collect()
        };
        for engine in engines {
            engine.close().await;
        }
    }
}
