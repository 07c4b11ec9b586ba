//! Ambient `/metrics` HTTP endpoint (SPEC_FULL.md §13), serving whatever
//! `PrometheusMetricsSink::encode_text` renders, in the teacher's
//! axum-state-handler shape.

use crate::config::MetricsConfig;
use crate::error::{TqdbError, TqdbResult};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use std::{net::SocketAddr, sync::Arc};

type GatherFn = Arc<dyn Fn() -> TqdbResult<String> + Send + Sync>;

#[derive(Clone)]
struct AppState {
    gather: GatherFn,
}

pub async fn run_metrics_server<G>(cfg: MetricsConfig, gather: G) -> TqdbResult<()>
where
    G: Fn() -> TqdbResult<String> + Send + Sync + 'static,
{
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .map_err(|e| TqdbError::InvalidConfig(format!("invalid metrics.listen_addr: {e}")))?;

    let state = AppState {
        gather: Arc::new(gather),
    };

    let app = Router::new()
        .route(&cfg.path, get(metrics_handler))
        .with_state(state);

    tracing::info!(
        listen_addr = %cfg.listen_addr,
        path = %cfg.path,
        "prometheus metrics server starting (axum)"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TqdbError::Internal(format!("failed to bind metrics server: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| TqdbError::Internal(format!("metrics server error: {e}")))?;

    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match (state.gather)() {
        Ok(text) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8".parse().unwrap(),
            );
            (StatusCode::OK, headers, text).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to gather metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "gather metrics failed\n").into_response()
        }
    }
}
