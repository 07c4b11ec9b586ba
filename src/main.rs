mod cli;

use clap::Parser;
use cli::Cli;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tqdbproxy::cache::CacheEngine;
use tqdbproxy::config::Config;
use tqdbproxy::context::ProxyContext;
use tqdbproxy::error::{TqdbError, TqdbResult};
use tqdbproxy::metrics::prometheus::PrometheusMetricsSink;
use tqdbproxy::metrics::{MetricsSink, NoopMetricsSink};
use tqdbproxy::pool::{BackendPool, PoolRegistry};
use tqdbproxy::{mariadb, postgres, prometheus as metrics_http};
use tracing_subscriber::EnvFilter;

fn main() -> TqdbResult<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.workers)
        .enable_all()
        .build()
        .map_err(|e| TqdbError::Internal(format!("failed to start tokio runtime: {e}")))?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> TqdbResult<()> {
    let config = Arc::new(load_config(&cli)?);
    init_tracing(&cli, &config);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let pools = Arc::new(build_pool_registry(&config, shutdown.clone())?);
    let cache = Arc::new(CacheEngine::new(config.cache.max_bytes, config.cache.stale_multiplier));
    let (metrics, prometheus_sink) = build_metrics_sink(&config)?;

    let ctx = ProxyContext::new(config.clone(), pools, cache, metrics, shutdown.clone());

    let mut tasks = tokio::task::JoinSet::new();

    if let Some(p) = &config.mariadb {
        let ctx = ctx.clone();
        let listen_addr = p.listen_addr.clone();
        let default_shard = p.default_shard.clone();
        tasks.spawn(async move { mariadb::serve(ctx, listen_addr, default_shard).await });
    }

    if let Some(p) = &config.postgres {
        let ctx = ctx.clone();
        let listen_addr = p.listen_addr.clone();
        let default_shard = p.default_shard.clone();
        tasks.spawn(async move { postgres::serve(ctx, listen_addr, default_shard).await });
    }

    if config.metrics.enabled {
        if let Some(sink) = prometheus_sink {
            let cfg = config.metrics.clone();
            tasks.spawn(async move {
                metrics_http::server::run_metrics_server(cfg, move || sink.encode_text()).await
            });
        } else {
            tracing::warn!("metrics.enabled is true but no prometheus sink is configured");
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        Some(result) = tasks.join_next() => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "front end task exited with an error");
            }
        }
    }

    shutdown.cancel();
    ctx.close_batch_engines().await;
    Ok(())
}

fn load_config(cli: &Cli) -> TqdbResult<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn init_tracing(cli: &Cli, config: &Config) {
    let directive = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_pool_registry(config: &Config, shutdown: tokio_util::sync::CancellationToken) -> TqdbResult<PoolRegistry> {
    let mut pools = HashMap::new();
    for shard in &config.shards {
        let primary = parse_addr(&shard.primary)?;
        let replicas = shard
            .replicas
            .iter()
            .map(|r| parse_addr(r))
            .collect::<TqdbResult<Vec<SocketAddr>>>()?;
        let pool = BackendPool::new(
            shard.name.clone(),
            primary,
            replicas,
            Duration::from_millis(shard.health_probe_interval_ms),
        );
        pool.spawn_health_probe(shutdown.clone());
        pools.insert(shard.name.clone(), pool);
    }
    Ok(PoolRegistry::new(pools))
}

fn parse_addr(raw: &str) -> TqdbResult<SocketAddr> {
    raw.parse()
        .map_err(|e| TqdbError::InvalidConfig(format!("invalid backend address '{raw}': {e}")))
}

fn build_metrics_sink(
    config: &Config,
) -> TqdbResult<(Arc<dyn MetricsSink>, Option<Arc<PrometheusMetricsSink>>)> {
    if config.metrics.enabled {
        let sink = Arc::new(PrometheusMetricsSink::new()?);
        Ok((sink.clone(), Some(sink)))
    } else {
        Ok((Arc::new(NoopMetricsSink), None))
    }
}
