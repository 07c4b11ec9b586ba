//! `BatchExecutor` for the MariaDB front end (spec.md §4.C execution
//! strategies). Batch dispatch opens its own backend connection rather than
//! reusing a client's socket, matching spec.md §5's "backend connections are
//! opened per client (no pool)" and the fact that a batch group can outlive
//! any single client connection.

use crate::batch::{BatchExecutor, BatchStatement, WriteResult};
use crate::error::{TqdbError, TqdbResult};
use crate::mariadb::protocol::{self, encode_ok_payload};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;

const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

/// Captured from the first client handshake against a shard; replayed
/// verbatim so the batch executor authenticates as the same user without
/// the proxy ever rewriting credential bytes (spec.md §4.E handshake
/// invariant).
#[derive(Clone)]
pub struct AuthReplay {
    pub handshake_response: Vec<u8>,
}

pub struct MariaDbBatchExecutor {
    addr: SocketAddr,
    auth: AuthReplay,
}

impl MariaDbBatchExecutor {
    pub fn new(addr: SocketAddr, auth: AuthReplay) -> Self {
        Self { addr, auth }
    }

    async fn dial(&self) -> TqdbResult<TcpStream> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| TqdbError::BackendDial {
                addr: self.addr.to_string(),
                source,
            })?;
        // Greeting.
        let (_seq, _greeting) = protocol::read_packet(&mut stream).await?;
        protocol::write_packet(&mut stream, 1, &self.auth.handshake_response).await?;
        let (_seq, resp) = protocol::read_packet(&mut stream).await?;
        if protocol::is_err(&resp) {
            return Err(TqdbError::ProtocolViolation(
                "batch executor authentication failed".into(),
            ));
        }
        Ok(stream)
    }

    async fn query(&self, stream: &mut TcpStream, sql: &str) -> TqdbResult<WriteResult> {
        let mut payload = vec![0x03u8]; // COM_QUERY
        payload.extend_from_slice(sql.as_bytes());
        protocol::write_packet(stream, 0, &payload).await?;
        let raw = protocol::read_full_response(stream).await?;
        parse_ok_from_raw(&raw)
    }

    /// `COM_STMT_EXECUTE` against an already-prepared statement id.
    /// `stmt.params` carries the execute tail (flags, iteration count, and
    /// any bound parameter bytes) when the caller supplies one; otherwise a
    /// minimal no-params tail (flags 0x00, iteration count 1) is used.
    async fn exec_prepared_statement(
        &self,
        stream: &mut TcpStream,
        stmt_id: u32,
        stmt: &BatchStatement,
    ) -> TqdbResult<WriteResult> {
        let mut payload = vec![COM_STMT_EXECUTE];
        payload.extend_from_slice(&stmt_id.to_le_bytes());
        if stmt.params.is_empty() {
            payload.push(0x00); // flags
            payload.extend_from_slice(&1u32.to_le_bytes()); // iteration count
        } else {
            payload.extend_from_slice(&stmt.params);
        }
        protocol::write_packet(stream, 0, &payload).await?;
        let raw = protocol::read_full_response(stream).await?;
        parse_ok_from_raw(&raw)
    }
}

fn parse_ok_from_raw(raw: &[u8]) -> TqdbResult<WriteResult> {
    if raw.len() < 5 {
        return Err(TqdbError::MalformedPacket("truncated response".into()));
    }
    let payload = &raw[4..];
    if protocol::is_err(payload) {
        return Err(TqdbError::BatchExec(String::from_utf8_lossy(payload).into_owned()));
    }
    // Lightweight OK parse: affected rows and last-insert-id as the two
    // length-encoded integers after the OK marker. Full lenenc decoding
    // covering the 0xFC/0xFD/0xFE prefixes mirrors `encode_ok_payload`.
    let (affected_rows, rest) = read_lenenc(&payload[1..]);
    let (last_insert_id, _rest) = read_lenenc(rest);
    Ok(WriteResult {
        affected_rows,
        last_insert_id,
        returning_values: None,
        batch_size: 0,
    })
}

fn read_lenenc(buf: &[u8]) -> (u64, &[u8]) {
    match buf.first() {
        Some(&b) if b < 0xFB => (b as u64, &buf[1..]),
        Some(0xFC) => (
            u16::from_le_bytes([buf[1], buf[2]]) as u64,
            &buf[3..],
        ),
        Some(0xFD) => (
            u32::from_le_bytes([buf[1], buf[2], buf[3], 0]) as u64,
            &buf[4..],
        ),
        Some(0xFE) => (
            u64::from_le_bytes(buf[1..9].try_into().unwrap_or_default()),
            &buf[9..],
        ),
        _ => (0, buf),
    }
}

#[async_trait]
impl BatchExecutor for MariaDbBatchExecutor {
    async fn exec_single(&self, stmt: &BatchStatement) -> TqdbResult<WriteResult> {
        let mut owned = self.dial().await?;
        let result = self.query(&mut owned, &stmt.query).await;
        result.map(|mut r| {
            r.batch_size = 1;
            r
        })
    }

    async fn exec_prepared_each(&self, statements: &[BatchStatement]) -> Vec<TqdbResult<WriteResult>> {
        let conn = self.dial().await;
        let mut stream = match conn {
            Ok(s) => s,
            Err(e) => return statements.iter().map(|_| Err(clone_err(&e))).collect(),
        };

        // All requests share identical query text (enforced by the
        // dispatcher before this strategy is chosen): prepare once, then
        // EXECUTE per statement against the resulting statement id.
        let query = match statements.first() {
            Some(first) => &first.query,
            None => return Vec::new(),
        };

        let mut prepare_payload = vec![COM_STMT_PREPARE];
        prepare_payload.extend_from_slice(query.as_bytes());
        if let Err(e) = protocol::write_packet(&mut stream, 0, &prepare_payload).await {
            return statements.iter().map(|_| Err(clone_err(&e))).collect();
        }

        let (raw, stmt_id) = match protocol::read_prepare_response(&mut stream).await {
            Ok(r) => r,
            Err(e) => return statements.iter().map(|_| Err(clone_err(&e))).collect(),
        };
        if protocol::is_err(&raw[4..]) {
            let err = TqdbError::BatchExec(String::from_utf8_lossy(&raw[4..]).into_owned());
            return statements.iter().map(|_| Err(clone_err(&err))).collect();
        }

        let mut out = Vec::with_capacity(statements.len());
        for stmt in statements {
            out.push(self.exec_prepared_statement(&mut stream, stmt_id, stmt).await);
        }

        let close_payload = [&[COM_STMT_CLOSE][..], &stmt_id.to_le_bytes()].concat();
        let _ = protocol::write_packet(&mut stream, 0, &close_payload).await;

        out
    }

    async fn exec_transaction(&self, statements: &[BatchStatement]) -> TqdbResult<Vec<WriteResult>> {
        let mut stream = self.dial().await?;
        self.query(&mut stream, "BEGIN").await?;

        let mut results = Vec::with_capacity(statements.len());
        for stmt in statements {
            match self.query(&mut stream, &stmt.query).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    let _ = self.query(&mut stream, "ROLLBACK").await;
                    return Err(e);
                }
            }
        }

        self.query(&mut stream, "COMMIT").await?;
        Ok(results)
    }
}

fn clone_err(e: &TqdbError) -> TqdbError {
    TqdbError::BatchExec(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_payload_round_trips_through_lenenc_reader() {
        let payload = encode_ok_payload(7, 99);
        let (rows, rest) = read_lenenc(&payload[1..]);
        assert_eq!(rows, 7);
        let (id, _) = read_lenenc(rest);
        assert_eq!(id, 99);
    }

    #[test]
    fn lenenc_handles_small_and_two_byte_forms() {
        assert_eq!(read_lenenc(&[5]).0, 5);
        assert_eq!(read_lenenc(&[0xFC, 0x2c, 0x01]).0, 300);
    }
}
