//! `BatchExecutor` for the PostgreSQL front end (spec.md §4.C), grounded on
//! the same per-batch-dedicated-connection pattern as
//! `mariadb::executor::MariaDbBatchExecutor`: the batch engine owns its own
//! backend connection rather than borrowing a client's socket, since a
//! batch group can outlive any single client connection.

use crate::batch::{BatchExecutor, BatchStatement, WriteResult};
use crate::error::{TqdbError, TqdbResult};
use crate::postgres::protocol::{self, MSG_COMMAND_COMPLETE, MSG_DATA_ROW, MSG_ERROR_RESPONSE};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Startup parameters captured from the first client connection to this
/// shard, replayed verbatim so the batch executor authenticates as the same
/// user without the proxy ever rewriting credential bytes.
#[derive(Clone)]
pub struct StartupReplay {
    pub params: Vec<(String, String)>,
}

pub struct PostgresBatchExecutor {
    addr: SocketAddr,
    startup: StartupReplay,
}

impl PostgresBatchExecutor {
    pub fn new(addr: SocketAddr, startup: StartupReplay) -> Self {
        Self { addr, startup }
    }

    async fn dial(&self) -> TqdbResult<TcpStream> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| TqdbError::BackendDial {
                addr: self.addr.to_string(),
                source,
            })?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&protocol::PROTOCOL_VERSION_3.to_be_bytes());
        for (k, v) in &self.startup.params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut msg = Vec::new();
        msg.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        msg.extend_from_slice(&payload);
        use tokio::io::AsyncWriteExt;
        stream.write_all(&msg).await?;

        loop {
            let m = protocol::read_message(&mut stream).await?;
            if protocol::is_error(m.tag) {
                return Err(TqdbError::ProtocolViolation(
                    "batch executor authentication failed".into(),
                ));
            }
            if m.tag == protocol::MSG_READY_FOR_QUERY {
                break;
            }
        }
        Ok(stream)
    }

    /// Execute one statement via Simple Query, reassemble the result, and
    /// translate it into a `WriteResult`, capturing `RETURNING` row bytes
    /// when present (spec.md §9 "Protocol-level passthrough for writes that
    /// return").
    async fn query(&self, stream: &mut TcpStream, sql: &str, has_returning: bool) -> TqdbResult<WriteResult> {
        use tokio::io::AsyncWriteExt;
        let mut body = Vec::with_capacity(sql.len() + 1);
        body.extend_from_slice(sql.as_bytes());
        body.push(0);
        protocol::write_message(stream, protocol::MSG_SIMPLE_QUERY, &body).await?;
        stream.flush().await?;

        let mut affected_rows: u64 = 0;
        let mut returning_rows: Vec<u8> = Vec::new();
        loop {
            let m = protocol::read_message(stream).await?;
            match m.tag {
                MSG_ERROR_RESPONSE => {
                    return Err(TqdbError::BatchExec(String::from_utf8_lossy(&m.body).into_owned()));
                }
                MSG_DATA_ROW => {
                    if has_returning {
                        returning_rows.extend_from_slice(&m.body);
                    }
                }
                MSG_COMMAND_COMPLETE => {
                    affected_rows = parse_affected_rows(&m.body);
                }
                protocol::MSG_READY_FOR_QUERY => break,
                _ => {}
            }
        }

        Ok(WriteResult {
            affected_rows,
            last_insert_id: 0,
            returning_values: if has_returning && !returning_rows.is_empty() {
                Some(returning_rows)
            } else {
                None
            },
            batch_size: 0,
        })
    }
}

/// `CommandComplete` tags look like `"INSERT 0 3\0"`, `"UPDATE 2\0"`,
/// `"DELETE 1\0"`: the affected-row count is always the last
/// whitespace-separated token.
fn parse_affected_rows(body: &[u8]) -> u64 {
    let text = String::from_utf8_lossy(body);
    text.trim_end_matches('\0')
        .split_whitespace()
        .last()
        .and_then(|tok| tok.parse::<u64>().ok())
        .unwrap_or(0)
}

#[async_trait]
impl BatchExecutor for PostgresBatchExecutor {
    async fn exec_single(&self, stmt: &BatchStatement) -> TqdbResult<WriteResult> {
        let mut conn = self.dial().await?;
        let result = self.query(&mut conn, &stmt.query, stmt.has_returning).await;
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

        let mut out = Vec::with_capacity(statements.len());
        for stmt in statements {
            out.push(self.query(&mut stream, &stmt.query, stmt.has_returning).await);
        }
        out
    }

    async fn exec_transaction(&self, statements: &[BatchStatement]) -> TqdbResult<Vec<WriteResult>> {
        let mut stream = self.dial().await?;
        self.query(&mut stream, "BEGIN", false).await?;

        let mut results = Vec::with_capacity(statements.len());
        for stmt in statements {
            match self.query(&mut stream, &stmt.query, stmt.has_returning).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    let _ = self.query(&mut stream, "ROLLBACK", false).await;
                    return Err(e);
                }
            }
        }

        self.query(&mut stream, "COMMIT", false).await?;
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
    fn parses_affected_rows_from_insert_tag() {
        assert_eq!(parse_affected_rows(b"INSERT 0 3\0"), 3);
        assert_eq!(parse_affected_rows(b"UPDATE 2\0"), 2);
        assert_eq!(parse_affected_rows(b"DELETE 1\0"), 1);
    }
}
