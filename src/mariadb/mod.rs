//! MariaDB front end (spec.md §4.E): handshake relay, command demultiplexing,
//! cache/batch/transparent routing, `USE`/`COM_INIT_DB` shard switching, and
//! `SHOW TQDB STATUS`.

pub mod executor;
pub mod protocol;

use crate::context::ProxyContext;
use crate::error::{TqdbError, TqdbResult};
use crate::hint::{self, ParsedQuery};
use crate::metrics::BackendLabel;
use crate::state::{ConnectionState, LastBackend};
use bytes::Bytes;
use executor::AuthReplay;
use protocol::{encode_err_payload, encode_ok_payload, encode_status_result_set};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;

/// Accept loop for the MariaDB listener: one task per client connection,
/// matching spec.md §5's "parallel threads of execution" model.
pub async fn serve(ctx: Arc<ProxyContext>, listen_addr: String, default_shard: String) -> TqdbResult<()> {
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "mariadb front end listening");
    let mut conn_id: u64 = 0;
    loop {
        let (client, peer) = listener.accept().await?;
        conn_id += 1;
        let ctx = ctx.clone();
        let default_shard = default_shard.clone();
        let id = conn_id;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, client, default_shard, id).await {
                warn!(conn_id = id, peer = %peer, error = %e, "mariadb connection ended with error");
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
    let pool = ctx
        .pools
        .get(&default_shard)
        .ok_or_else(|| TqdbError::UnknownShard(default_shard.clone()))?;

    let mut backend = dial(pool.primary()).await?;
    let handshake_response = relay_handshake(&mut client, &mut backend).await?;
    let auth = AuthReplay { handshake_response };

    let mut state = ConnectionState::new(default_shard.clone(), String::new());
    debug!(conn_id, shard = %state.shard_name, "mariadb handshake complete");

    loop {
        let (seq, payload) = match protocol::read_packet(&mut client).await {
            Ok(p) => p,
            Err(_) => return Ok(()), // client closed
        };

        let Some(&cmd) = payload.first() else { continue };

        if cmd == COM_QUIT {
            return Ok(());
        }

        let result = dispatch(
            &ctx,
            &mut client,
            &mut backend,
            &mut state,
            &auth,
            seq,
            cmd,
            &payload,
        )
        .await;

        if let Err(e) = result {
            error!(conn_id, error = %e, "mariadb command failed");
            let err_payload = encode_err_payload(1105, &e.to_string());
            protocol::write_packet(&mut client, seq.wrapping_add(1), &err_payload).await?;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    seq: u8,
    cmd: u8,
    payload: &[u8],
) -> TqdbResult<()> {
    match cmd {
        COM_QUERY => handle_query(ctx, client, backend, state, auth, seq, &payload[1..]).await,
        COM_INIT_DB => {
            let db = String::from_utf8_lossy(&payload[1..]).trim().to_string();
            switch_database(ctx, backend, state, auth, &db).await?;
            forward_and_relay(client, backend, seq, payload).await
        }
        COM_STMT_PREPARE => {
            let sql = String::from_utf8_lossy(&payload[1..]).to_string();
            protocol::write_packet(backend, seq, payload).await?;
            let (raw, stmt_id) = protocol::read_prepare_response(backend).await?;
            if stmt_id != 0 {
                let parsed = hint::parse(&sql);
                state
                    .prepared_statements
                    .insert(stmt_id.to_string(), parsed);
            }
            client.write_all(&raw).await?;
            Ok(())
        }
        COM_STMT_EXECUTE => handle_stmt_execute(ctx, client, backend, state, auth, seq, payload).await,
        _ => forward_and_relay(client, backend, seq, payload).await,
    }
}

async fn forward_and_relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    seq: u8,
    payload: &[u8],
) -> TqdbResult<()> {
    protocol::write_packet(backend, seq, payload).await?;
    let raw = protocol::read_full_response(backend).await?;
    client.write_all(&raw).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_query(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    seq: u8,
    sql_bytes: &[u8],
) -> TqdbResult<()> {
    let sql = String::from_utf8_lossy(sql_bytes).into_owned();

    if is_show_status(&sql) {
        let rows = state.status_rows();
        let raw = encode_status_result_set(&rows);
        client.write_all(&raw).await?;
        return Ok(());
    }

    crate::state::transaction_trap(&sql, &mut state.in_transaction);

    if let Some(db) = parse_use_statement(&sql) {
        switch_database(ctx, backend, state, auth, &db).await?;
        let ok = encode_ok_payload(0, 0);
        protocol::write_packet(client, seq.wrapping_add(1), &ok).await?;
        return Ok(());
    }

    let parsed = hint::parse(&sql);

    if parsed.is_cacheable() && !state.in_transaction {
        return serve_cacheable(ctx, client, state, auth, parsed.query.as_bytes(), &parsed).await;
    }

    if parsed.is_batchable() && !state.in_transaction {
        return serve_batchable(ctx, client, state, auth, seq, &parsed, Vec::new()).await;
    }

    ctx.metrics.inc_total_queries(false);
    let t0 = Instant::now();
    protocol::write_packet(backend, seq, &{
        let mut p = vec![COM_QUERY];
        p.extend_from_slice(sql_bytes);
        p
    })
    .await?;
    let raw = protocol::read_full_response(backend).await?;
    ctx.metrics
        .observe_query_latency(&parsed.file, parsed.line, parsed.query_type.as_str(), t0.elapsed().as_secs_f64());
    ctx.metrics.inc_backend_query(&BackendLabel::Primary);
    state.last_backend_used = LastBackend::Primary;
    client.write_all(&raw).await?;
    Ok(())
}

async fn handle_stmt_execute(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    seq: u8,
    payload: &[u8],
) -> TqdbResult<()> {
    if payload.len() < 5 {
        return forward_and_relay(client, backend, seq, payload).await;
    }
    let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let parsed = state.prepared_statements.get(&stmt_id.to_string()).cloned();

    let Some(parsed) = parsed else {
        return forward_and_relay(client, backend, seq, payload).await;
    };

    if parsed.is_cacheable() && !state.in_transaction {
        let mut key = parsed.query.clone().into_bytes();
        key.extend_from_slice(&payload[5..]);
        return serve_cacheable_execute(ctx, client, state, auth, &key, &parsed, &payload[5..]).await;
    }

    forward_and_relay(client, backend, seq, payload).await
}

async fn serve_cacheable(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    key: &[u8],
    parsed: &ParsedQuery,
) -> TqdbResult<()> {
    serve_cacheable_inner(ctx, client, state, auth, key, parsed, None).await
}

async fn serve_cacheable_execute(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    key: &[u8],
    parsed: &ParsedQuery,
    exec_tail: &[u8],
) -> TqdbResult<()> {
    serve_cacheable_inner(ctx, client, state, auth, key, parsed, Some(exec_tail)).await
}

/// Shared cold-miss/stale-refresh path for `COM_QUERY` and
/// `COM_STMT_EXECUTE` (spec.md §4.B/§4.E). `exec_tail` is `Some` for
/// prepared executes: the raw bytes after the statement id, reused to
/// rebuild an `EXECUTE` against the replica's own statement id.
async fn serve_cacheable_inner(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    key: &[u8],
    parsed: &ParsedQuery,
    exec_tail: Option<&[u8]>,
) -> TqdbResult<()> {
    let t0 = Instant::now();
    let lookup = ctx.cache.get_or_wait(key).await;

    if lookup.is_producer {
        let pool = ctx
            .pools
            .get(&state.shard_name)
            .ok_or_else(|| TqdbError::UnknownShard(state.shard_name.clone()))?;
        let (replica_addr, replica_idx) = pool.replica_with_index();
        let fetch = fetch_from_replica(replica_addr, auth, &parsed.query, exec_tail).await;
        match fetch {
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
            spawn_refresh(ctx.clone(), state.shard_name.clone(), auth.clone(), key.to_vec(), parsed.clone(), exec_tail.map(|t| t.to_vec()));
        }
        client.write_all(&raw).await?;
    } else {
        // Canceled in-flight fetch; caller observes absence and falls back
        // to a direct (uncached) forward rather than hanging.
        ctx.metrics.inc_cache_miss();
        return Err(TqdbError::Internal("cache producer canceled without a result".into()));
    }

    ctx.metrics
        .observe_query_latency(&parsed.file, parsed.line, parsed.query_type.as_str(), t0.elapsed().as_secs_f64());
    Ok(())
}

fn spawn_refresh(
    ctx: Arc<ProxyContext>,
    shard_name: String,
    auth: AuthReplay,
    key: Vec<u8>,
    parsed: ParsedQuery,
    exec_tail: Option<Vec<u8>>,
) {
    let refresh_timeout = std::time::Duration::from_millis(ctx.config.cache.refresh_timeout_ms);
    tokio::spawn(async move {
        let Some(pool) = ctx.pools.get(&shard_name) else {
            return;
        };
        let addr = pool.replica();
        let fetch = tokio::time::timeout(
            refresh_timeout,
            fetch_from_replica(addr, &auth, &parsed.query, exec_tail.as_deref()),
        )
        .await;
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

fn replica_label(replica_idx: Option<usize>) -> BackendLabel {
    match replica_idx {
        Some(i) => BackendLabel::Replica(i),
        None => BackendLabel::Primary,
    }
}

/// Open a short-lived connection to `addr`, authenticate by replaying the
/// captured handshake bytes, run the query (or prepare+execute for a
/// prepared statement), and return the raw response bytes (spec.md §6
/// "a separate connection may be opened to a replica for a given cacheable
/// SELECT").
async fn fetch_from_replica(
    addr: SocketAddr,
    auth: &AuthReplay,
    query: &str,
    exec_tail: Option<&[u8]>,
) -> TqdbResult<Vec<u8>> {
    let mut stream = dial(addr).await?;
    replay_auth(&mut stream, auth).await?;

    match exec_tail {
        None => {
            let mut p = vec![COM_QUERY];
            p.extend_from_slice(query.as_bytes());
            protocol::write_packet(&mut stream, 0, &p).await?;
            protocol::read_full_response(&mut stream).await
        }
        Some(tail) => {
            let mut prep = vec![COM_STMT_PREPARE];
            prep.extend_from_slice(query.as_bytes());
            protocol::write_packet(&mut stream, 0, &prep).await?;
            let (_raw, stmt_id) = protocol::read_prepare_response(&mut stream).await?;

            let mut exec = vec![COM_STMT_EXECUTE];
            exec.extend_from_slice(&stmt_id.to_le_bytes());
            exec.extend_from_slice(tail);
            protocol::write_packet(&mut stream, 0, &exec).await?;
            protocol::read_full_response(&mut stream).await
        }
    }
}

async fn replay_auth(stream: &mut TcpStream, auth: &AuthReplay) -> TqdbResult<()> {
    let (_seq, _greeting) = protocol::read_packet(stream).await?;
    protocol::write_packet(stream, 1, &auth.handshake_response).await?;
    let (_seq, resp) = protocol::read_packet(stream).await?;
    if protocol::is_err(&resp) {
        return Err(TqdbError::ProtocolViolation("replica authentication failed".into()));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn serve_batchable(
    ctx: &Arc<ProxyContext>,
    client: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    seq: u8,
    parsed: &ParsedQuery,
    params: Vec<u8>,
) -> TqdbResult<()> {
    let pool = ctx
        .pools
        .get(&state.shard_name)
        .ok_or_else(|| TqdbError::UnknownShard(state.shard_name.clone()))?;
    let engine = ctx.mariadb_batch_engine(&state.shard_name, pool.primary(), auth.clone());

    let stmt = crate::batch::BatchStatement {
        query: parsed.query.clone(),
        params,
        has_returning: false,
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
    let ok = encode_ok_payload(result.affected_rows, result.last_insert_id);
    protocol::write_packet(client, seq.wrapping_add(1), &ok).await?;
    Ok(())
}

async fn switch_database(
    ctx: &Arc<ProxyContext>,
    backend: &mut TcpStream,
    state: &mut ConnectionState,
    auth: &AuthReplay,
    db: &str,
) -> TqdbResult<()> {
    let new_shard = ctx.config.resolve_shard(db, &state.shard_name).to_string();
    state.database = db.to_string();

    if new_shard == state.shard_name {
        return Ok(());
    }
    if state.in_transaction {
        return Err(TqdbError::ProtocolViolation(
            "cannot switch shard while a transaction is open".into(),
        ));
    }

    let pool = ctx
        .pools
        .get(&new_shard)
        .ok_or_else(|| TqdbError::UnknownShard(new_shard.clone()))?;
    let mut new_backend = dial(pool.primary()).await?;
    replay_auth(&mut new_backend, auth).await?;

    *backend = new_backend;
    state.shard_name = new_shard;
    Ok(())
}

fn is_show_status(sql: &str) -> bool {
    sql.trim().eq_ignore_ascii_case("SHOW TQDB STATUS")
}

fn parse_use_statement(sql: &str) -> Option<String> {
    let trimmed = sql.trim();
    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("USE ") {
        let db = trimmed[4..].trim().trim_matches(|c| c == '`' || c == ';').to_string();
        Some(db)
    } else {
        None
    }
}

async fn relay_handshake(client: &mut TcpStream, backend: &mut TcpStream) -> TqdbResult<Vec<u8>> {
    let (greet_seq, greeting) = protocol::read_packet(backend).await?;
    protocol::write_packet(client, greet_seq, &greeting).await?;

    let (resp_seq, handshake_response) = protocol::read_packet(client).await?;
    protocol::write_packet(backend, resp_seq, &handshake_response).await?;

    loop {
        let (seq, pkt) = protocol::read_packet(backend).await?;
        protocol::write_packet(client, seq, &pkt).await?;
        if protocol::is_ok(&pkt) || protocol::is_err(&pkt) {
            break;
        }
        let (cseq, cpkt) = protocol::read_packet(client).await?;
        protocol::write_packet(backend, cseq, &cpkt).await?;
    }

    Ok(handshake_response)
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
    fn parses_use_statement() {
        assert_eq!(parse_use_statement("USE shop").as_deref(), Some("shop"));
        assert_eq!(parse_use_statement("use `shop`;").as_deref(), Some("shop"));
        assert_eq!(parse_use_statement("SELECT 1"), None);
    }

    #[test]
    fn show_status_is_case_insensitive() {
        assert!(is_show_status("show tqdb status"));
        assert!(is_show_status("SHOW TQDB STATUS"));
        assert!(!is_show_status("SHOW STATUS"));
    }
}
