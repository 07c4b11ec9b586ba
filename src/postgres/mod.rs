//! PostgreSQL front end (spec.md §4.F): startup/SSL-deny, simple and
//! extended query subprotocols, `pg_tqdb_status`.
//!
//! Sharding is pinned at startup from the `database` connection parameter
//! and never changes for the connection's lifetime (spec.md §9 "Sharding is
//! database-level only").

pub mod executor;
pub mod protocol;

use crate::context::ProxyContext;
use crate::error::{TqdbError, TqdbResult};
use crate::hint::{self, ParsedQuery};
use crate::metrics::BackendLabel;
use crate::state::{ConnectionState, LastBackend};
use bytes::Bytes;
use executor::StartupReplay;
use protocol::{Message, MSG_BIND, MSG_DESCRIBE, MSG_EXECUTE, MSG_PARSE, MSG_SYNC, MSG_TERMINATE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

/// Accept loop for the PostgreSQL listener: one task per client connection.
pub async fn serve(ctx: Arc<ProxyContext>, listen_addr: String, default_shard: String) -> TqdbResult<()> {
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "postgres front end listening");
    let mut conn_id: u64 = 0;
    loop {
        let (client, peer) = listener.accept().await?;
        conn_id += 1;
        let ctx = ctx.clone();
        let default_shard = default_shard.clone();
        let id = conn_id;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, client, default_shard, id).await {
                warn!(conn_id = id, peer = %peer, error = %e, "postgres connection ended with error");
            }
        });
    }
}

#[instrument(skip(ctx, client), fields(conn_id))]
async fn handle_connection(
    ctx: Arc<ProxyContext>,
    mut client: TcpStream,
    default_shard: String,
    conn_id: u64,
) -> TqdbResult<()> {
    let params = loop {
        match protocol::read_startup(&mut client).await? {
            protocol::StartupOutcome::SslRequest => {
                protocol::deny_ssl(&mut client).await?;
            }
            protocol::StartupOutcome::Startup { params } => break params,
        }
    };

    let database = protocol::param(&params, "database").unwrap_or_default();
    let shard_name = ctx.config.resolve_shard(&database, &default_shard).to_string();

    let pool = ctx
        .pools
        .get(&shard_name)
        .ok_or_else(|| TqdbError::UnknownShard(shard_name.clone()))?;

    let mut backend = dial(pool.primary()).await?;
    send_startup(&mut backend, &params).await?;
    protocol::relay_until_ready(&mut backend, &mut client).await?;

    let startup = StartupReplay { params };
    let mut state = ConnectionState::new(shard_name, database);
    debug!(conn_id, shard = %state.shard_name, "postgres startup complete");

    let mut extended_buf: Vec<Message> = Vec::new();

    loop {
        let msg = match protocol::read_message(&mut client).await {
            Ok(m) => m,
            Err(_) => return Ok(()), // client closed
        };

        match msg.tag {
            MSG_TERMINATE => return Ok(()),
            protocol::MSG_SIMPLE_QUERY => {
                if let Err(e) = handle_simple_query(&ctx, &mut client, &mut backend, &mut state, &startup, &msg.body).await {
                    send_error_and_ready(&mut client, &e).await?;
                }
            }
            MSG_PARSE | MSG_BIND | MSG_DESCRIBE | MSG_EXECUTE => {
                extended_buf.push(msg);
            }
            MSG_SYNC => {
                if let Err(e) = handle_extended_sync(&ctx, &mut client, &mut backend, &mut state, &startup, &mut extended_buf).await {
                    send_error_and_ready(&mut client, &e).await?;
                    extended_buf.clear();
                }
            }
            _ => {
                protocol::write_message(&mut backend, msg.tag, &msg.body).await?;
            }
        }
    }
}

async fn send_error_and_ready(client: &mut TcpStream, e: &TqdbError) -> TqdbResult<()> {
    let body = protocol::encode_error_response("ERROR", "58000", &e.to_string());
    protocol::write_message(client, protocol::MSG_ERROR_RESPONSE, &body).await?;
    protocol::write_ready_for_query(client).await
}

async fn handle_simple_query(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    startup: &StartupReplay,
    body: &[u8],
) -> TqdbResult<()> {
    let sql = String::from_utf8_lossy(body).trim_end_matches('\0').to_string();

    if protocol::is_status_query(&sql) {
        let rows = state.status_rows();
        let raw = protocol::encode_status_result_set(&rows);
        client.write_all(&raw).await?;
        return Ok(());
    }

    crate::state::transaction_trap(&sql, &mut state.in_transaction);

    let parsed = hint::parse(&sql);

    if parsed.is_cacheable() && !state.in_transaction {
        return serve_cacheable(ctx, client, state, startup, parsed.query.as_bytes(), &parsed).await;
    }

    if parsed.is_batchable() && !state.in_transaction {
        return serve_batchable(ctx, client, state, startup, &parsed, Vec::new()).await;
    }

    ctx.metrics.inc_total_queries(false);
    let t0 = Instant::now();
    let mut q = Vec::with_capacity(sql.len() + 1);
    q.extend_from_slice(sql.as_bytes());
    q.push(0);
    protocol::write_message(backend, protocol::MSG_SIMPLE_QUERY, &q).await?;
    let raw = protocol::read_simple_query_response(backend).await?;
    ctx.metrics.observe_query_latency(&parsed.file, parsed.line, parsed.query_type.as_str(), t0.elapsed().as_secs_f64());
    ctx.metrics.inc_backend_query(&BackendLabel::Primary);
    state.last_backend_used = LastBackend::Primary;
    client.write_all(&raw).await?;
    Ok(())
}

/// Extended-protocol Sync dispatch (spec.md §4.F and §9 Open Question:
/// caching is scoped to Simple Query; extended-protocol Execute only gets
/// the write-batch fast path, and otherwise forwards transparently).
async fn handle_extended_sync(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    startup: &StartupReplay,
    buf: &mut Vec<Message>,
) -> TqdbResult<()> {
    let mut stmt_texts: std::collections::HashMap<String, ParsedQuery> = std::collections::HashMap::new();
    let mut portal_to_stmt: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut last_execute_portal: Option<String> = None;

    for msg in buf.iter() {
        match msg.tag {
            MSG_PARSE => {
                if let Some((stmt_name, sql)) = parse_parse_message(&msg.body) {
                    stmt_texts.insert(stmt_name, hint::parse(&sql));
                }
            }
            MSG_BIND => {
                if let Some((portal, stmt_name)) = parse_bind_message(&msg.body) {
                    portal_to_stmt.insert(portal, stmt_name);
                }
            }
            MSG_EXECUTE => {
                if let Some(portal) = parse_execute_message(&msg.body) {
                    last_execute_portal = Some(portal);
                }
            }
            _ => {}
        }
    }

    let routed = last_execute_portal
        .as_ref()
        .and_then(|portal| portal_to_stmt.get(portal))
        .and_then(|stmt_name| stmt_texts.get(stmt_name))
        .cloned();

    if let Some(parsed) = routed {
        crate::state::transaction_trap(&parsed.query, &mut state.in_transaction);
        if parsed.is_batchable() && !state.in_transaction {
            let parse_count = buf.iter().filter(|m| m.tag == MSG_PARSE).count();
            let bind_count = buf.iter().filter(|m| m.tag == MSG_BIND).count();
            buf.clear();
            for _ in 0..parse_count {
                protocol::write_message(client, protocol::MSG_PARSE_COMPLETE, b"").await?;
            }
            for _ in 0..bind_count {
                protocol::write_message(client, protocol::MSG_BIND_COMPLETE, b"").await?;
            }
            return serve_batchable(ctx, client, state, startup, &parsed, Vec::new()).await;
        }
    }

    // Not intercepted: forward the buffered sequence plus Sync transparently.
    for msg in buf.drain(..) {
        protocol::write_message(backend, msg.tag, &msg.body).await?;
    }
    protocol::write_message(backend, MSG_SYNC, b"").await?;
    let raw = protocol::read_simple_query_response(backend).await?;
    ctx.metrics.inc_backend_query(&BackendLabel::Primary);
    state.last_backend_used = LastBackend::Primary;
    client.write_all(&raw).await?;
    Ok(())
}

fn cstr_at(buf: &[u8], start: usize) -> Option<(String, usize)> {
    let end = buf[start..].iter().position(|&b| b == 0)? + start;
    Some((String::from_utf8_lossy(&buf[start..end]).into_owned(), end + 1))
}

fn parse_parse_message(body: &[u8]) -> Option<(String, String)> {
    let (stmt_name, next) = cstr_at(body, 0)?;
    let (query, _) = cstr_at(body, next)?;
    Some((stmt_name, query))
}

fn parse_bind_message(body: &[u8]) -> Option<(String, String)> {
    let (portal, next) = cstr_at(body, 0)?;
    let (stmt_name, _) = cstr_at(body, next)?;
    Some((portal, stmt_name))
}

fn parse_execute_message(body: &[u8]) -> Option<String> {
    let (portal, _) = cstr_at(body, 0)?;
    Some(portal)
}

async fn serve_cacheable(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    startup: &StartupReplay,
    key: &[u8],
    parsed: &ParsedQuery,
) -> TqdbResult<()> {
    let t0 = Instant::now();
    let lookup = ctx.cache.get_or_wait(key).await;

    if lookup.is_producer {
        let pool = ctx
            .pools
            .get(&state.shard_name)
            .ok_or_else(|| TqdbError::UnknownShard(state.shard_name.clone()))?;
        let (replica_addr, replica_idx) = pool.replica_with_index();
        match fetch_from_replica(replica_addr, startup, &parsed.query).await {
            Ok(raw) => {
                ctx.cache.set_and_notify(key, Bytes::from(raw.clone()), parsed.ttl_secs);
                ctx.metrics.inc_total_queries(false);
                ctx.metrics.inc_cache_miss();
                ctx.metrics.inc_backend_query(&replica_label(replica_idx));
                state.last_backend_used = match replica_idx {
                    Some(i) => LastBackend::Replica(i),
                    None => LastBackend::Primary,
                };
                state.last_cache_hit = false;
                client.write_all(&raw).await?;
            }
            Err(e) => {
                ctx.cache.cancel(key);
                return Err(e);
            }
        }
    } else if lookup.present() {
        let raw = lookup.value.expect("present implies Some");
        state.last_backend_used = LastBackend::Cache;
        state.last_cache_hit = true;
        ctx.metrics.inc_total_queries(true);
        ctx.metrics.inc_cache_hit();

        if matches!(lookup.flag, crate::cache::CacheFlag::RefreshToken) {
            spawn_refresh(ctx.clone(), state.shard_name.clone(), startup.clone(), key.to_vec(), parsed.clone());
        }
        client.write_all(&raw).await?;
    } else {
        ctx.metrics.inc_cache_miss();
        return Err(TqdbError::Internal("cache producer canceled without a result".into()));
    }

    ctx.metrics.observe_query_latency(&parsed.file, parsed.line, parsed.query_type.as_str(), t0.elapsed().as_secs_f64());
    Ok(())
}

fn spawn_refresh(
    ctx: Arc<ProxyContext>,
    shard_name: String,
    startup: StartupReplay,
    key: Vec<u8>,
    parsed: ParsedQuery,
) {
    let refresh_timeout = std::time::Duration::from_millis(ctx.config.cache.refresh_timeout_ms);
    tokio::spawn(async move {
        let Some(pool) = ctx.pools.get(&shard_name) else {
            return;
        };
        let addr = pool.replica();
        let fetch = tokio::time::timeout(refresh_timeout, fetch_from_replica(addr, &startup, &parsed.query)).await;
        match fetch {
            Ok(Ok(raw)) => ctx.cache.set(&key, Bytes::from(raw), parsed.ttl_secs),
            Ok(Err(e)) => warn!(error = %e, "background cache refresh failed"),
            Err(_) => warn!(
                timeout_ms = refresh_timeout.as_millis() as u64,
                "background cache refresh timed out"
            ),
        }
    });
}

async fn fetch_from_replica(addr: SocketAddr, startup: &StartupReplay, query: &str) -> TqdbResult<Vec<u8>> {
    let mut stream = dial(addr).await?;
    send_startup(&mut stream, &startup.params).await?;
    drain_until_ready(&mut stream).await?;

    let mut body = Vec::with_capacity(query.len() + 1);
    body.extend_from_slice(query.as_bytes());
    body.push(0);
    protocol::write_message(&mut stream, protocol::MSG_SIMPLE_QUERY, &body).await?;
    protocol::read_simple_query_response(&mut stream).await
}

async fn drain_until_ready(stream: &mut TcpStream) -> TqdbResult<()> {
    loop {
        let m = protocol::read_message(stream).await?;
        if protocol::is_error(m.tag) {
            return Err(TqdbError::ProtocolViolation("replica authentication failed".into()));
        }
        if m.tag == protocol::MSG_READY_FOR_QUERY {
            return Ok(());
        }
    }
}

async fn serve_batchable(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    startup: &StartupReplay,
    parsed: &ParsedQuery,
    params: Vec<u8>,
) -> TqdbResult<()> {
    let pool = ctx
        .pools
        .get(&state.shard_name)
        .ok_or_else(|| TqdbError::UnknownShard(state.shard_name.clone()))?;
    let engine = ctx.postgres_batch_engine(&state.shard_name, pool.primary(), startup.clone());

    let has_returning = parsed.has_returning();
    let stmt = crate::batch::BatchStatement {
        query: parsed.query.clone(),
        params,
        has_returning,
    };

    let result = engine
        .enqueue(
            &ctx.shutdown.clone(),
            parsed.batch_key().to_string(),
            stmt,
            parsed.query_type,
            parsed.batch_ms,
            None,
        )
        .await?;

    state.batch_size_observed = result.batch_size;
    state.last_backend_used = LastBackend::Primary;

    let tag = protocol::command_complete_tag(parsed.query_type.as_str(), result.affected_rows);
    let mut complete_body = Vec::with_capacity(tag.len() + 1);
    complete_body.extend_from_slice(tag.as_bytes());
    complete_body.push(0);
    protocol::write_message(client, protocol::MSG_COMMAND_COMPLETE, &complete_body).await?;
    protocol::write_ready_for_query(client).await?;
    Ok(())
}

async fn send_startup(stream: &mut TcpStream, params: &[(String, String)]) -> TqdbResult<()> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&protocol::PROTOCOL_VERSION_3.to_be_bytes());
    for (k, v) in params {
        payload.extend_from_slice(k.as_bytes());
        payload.push(0);
        payload.extend_from_slice(v.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    let mut msg = Vec::new();
    msg.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    msg.extend_from_slice(&payload);
    stream.write_all(&msg).await?;
    Ok(())
}

fn replica_label(replica_idx: Option<usize>) -> BackendLabel {
    match replica_idx {
        Some(i) => BackendLabel::Replica(i),
        None => BackendLabel::Primary,
    }
}

async fn dial(addr: SocketAddr) -> TqdbResult<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| TqdbError::BackendDial {
            addr: addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parse_message_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"stmt1\0");
        body.extend_from_slice(b"SELECT 1\0");
        body.extend_from_slice(&0i16.to_be_bytes());
        let (name, query) = parse_parse_message(&body).unwrap();
        assert_eq!(name, "stmt1");
        assert_eq!(query, "SELECT 1");
    }

    #[test]
    fn parses_bind_message_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"portal1\0");
        body.extend_from_slice(b"stmt1\0");
        let (portal, stmt) = parse_bind_message(&body).unwrap();
        assert_eq!(portal, "portal1");
        assert_eq!(stmt, "stmt1");
    }
}
