//! PostgreSQL message framing and response reassembly (spec.md §4.F).
//!
//! Startup is untyped (`[len32 | body]`); every message after that carries a
//! one-byte type tag (`[type1 | len32 | body]`, where `len32` counts itself
//! but not the type byte). A backend's response to one frontend request ends
//! at the next `ReadyForQuery` ('Z').

use crate::error::{TqdbError, TqdbResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const PROTOCOL_VERSION_3: i32 = 0x0003_0000;

pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_ROW_DESCRIPTION: u8 = b'T';
pub const MSG_DATA_ROW: u8 = b'D';
pub const MSG_COMMAND_COMPLETE: u8 = b'C';
pub const MSG_SIMPLE_QUERY: u8 = b'Q';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_BIND: u8 = b'B';
pub const MSG_EXECUTE: u8 = b'E';
pub const MSG_DESCRIBE: u8 = b'D';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_TERMINATE: u8 = b'X';
pub const MSG_PARSE_COMPLETE: u8 = b'1';
pub const MSG_BIND_COMPLETE: u8 = b'2';
pub const MSG_EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const MSG_AUTH: u8 = b'R';

/// One typed, length-framed message (the type byte is absent only for the
/// very first frontend startup message).
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: u8,
    pub body: Vec<u8>,
}

/// Read one `[type1 | len32 | body]` message.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> TqdbResult<Message> {
    let mut tag = [0u8; 1];
    stream.read_exact(&mut tag).await?;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);
    if len < 4 {
        return Err(TqdbError::MalformedPacket(format!(
            "message length {len} smaller than the length field itself"
        )));
    }
    let body_len = (len as usize) - 4;
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        stream.read_exact(&mut body).await?;
    }
    Ok(Message { tag: tag[0], body })
}

/// Write one `[type1 | len32 | body]` message.
pub async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    tag: u8,
    body: &[u8],
) -> TqdbResult<()> {
    stream.write_all(&[tag]).await?;
    let len = (body.len() as i32) + 4;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

fn append_message(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    buf.push(tag);
    let len = (body.len() as i32) + 4;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
}

/// Outcome of reading the client's opening bytes on a fresh connection.
pub enum StartupOutcome {
    /// A real `StartupMessage`: protocol version plus `key\0value\0...`
    /// parameters, most importantly `database` and `user`.
    Startup { params: Vec<(String, String)> },
    /// `SSLRequest`: the caller must reply `N` and read the next startup
    /// message (spec.md §4.F "SSL negotiations are declined").
    SslRequest,
}

/// Read the client's first length-prefixed, untyped message and classify it
/// as a startup or an `SSLRequest`.
pub async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> TqdbResult<StartupOutcome> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf) as usize;
    if len < 8 {
        return Err(TqdbError::MalformedPacket("startup message too short".into()));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;

    let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if code == SSL_REQUEST_CODE {
        return Ok(StartupOutcome::SslRequest);
    }

    let mut params = Vec::new();
    let mut rest = &body[4..];
    loop {
        let Some(key_end) = rest.iter().position(|&b| b == 0) else {
            break;
        };
        if key_end == 0 {
            break; // trailing NUL terminator of the parameter list
        }
        let key = String::from_utf8_lossy(&rest[..key_end]).into_owned();
        rest = &rest[key_end + 1..];
        let Some(val_end) = rest.iter().position(|&b| b == 0) else {
            break;
        };
        let value = String::from_utf8_lossy(&rest[..val_end]).into_owned();
        rest = &rest[val_end + 1..];
        params.push((key, value));
    }

    Ok(StartupOutcome::Startup { params })
}

/// Reply `N` to a declined `SSLRequest` (spec.md §4.F / §6 "SSL
/// negotiations are declined").
pub async fn deny_ssl<S: AsyncWrite + Unpin>(stream: &mut S) -> TqdbResult<()> {
    stream.write_all(b"N").await?;
    Ok(())
}

pub fn param(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Relay backend authentication/parameter-status chatter to the client until
/// `ReadyForQuery`, returning the raw bytes relayed (header included).
pub async fn relay_until_ready<R, W>(backend: &mut R, client: &mut W) -> TqdbResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let msg = read_message(backend).await?;
        append_message(&mut buf, msg.tag, &msg.body);
        write_message(client, msg.tag, &msg.body).await?;
        if msg.tag == MSG_READY_FOR_QUERY {
            break;
        }
    }
    Ok(buf)
}

/// Read one full response to a Simple Query — every message up to and
/// including the matching `ReadyForQuery` — and return the raw wire bytes
/// so the caller can relay them verbatim or admit them to the cache
/// (spec.md §4.F Frame reassembly).
pub async fn read_simple_query_response<S: AsyncRead + Unpin>(stream: &mut S) -> TqdbResult<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let msg = read_message(stream).await?;
        append_message(&mut buf, msg.tag, &msg.body);
        if msg.tag == MSG_READY_FOR_QUERY {
            break;
        }
    }
    Ok(buf)
}

/// Write a previously captured/cached raw response byte-for-byte.
pub async fn write_raw<S: AsyncWrite + Unpin>(stream: &mut S, raw: &[u8]) -> TqdbResult<()> {
    stream.write_all(raw).await?;
    Ok(())
}

pub fn is_error(tag: u8) -> bool {
    tag == MSG_ERROR_RESPONSE
}

/// Build an `ErrorResponse` body: one `Severity`/`Code`/`Message` field set,
/// NUL-terminated, terminated by a final NUL.
pub fn encode_error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(severity.as_bytes());
    body.push(0);
    body.push(b'C');
    body.extend_from_slice(code.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);
    body
}

pub async fn write_ready_for_query<S: AsyncWrite + Unpin>(stream: &mut S) -> TqdbResult<()> {
    write_message(stream, MSG_READY_FOR_QUERY, b"I").await
}

/// `CommandComplete` tag string, e.g. `"INSERT 0 3"` / `"UPDATE 2"`.
pub fn command_complete_tag(query_type: &str, affected_rows: u64) -> String {
    match query_type {
        "INSERT" => format!("INSERT 0 {affected_rows}"),
        "UPDATE" => format!("UPDATE {affected_rows}"),
        "DELETE" => format!("DELETE {affected_rows}"),
        other => format!("{other} {affected_rows}"),
    }
}

fn write_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Synthesize the `pg_tqdb_status` virtual table: a `RowDescription` with
/// two text columns (`variable_name`, `value`), one `DataRow` per status
/// field, a `CommandComplete`, and a trailing `ReadyForQuery` — matching the
/// shape a real `SELECT` would produce so the client's row decoder needs no
/// special case (spec.md §6 Status inspection).
pub fn encode_status_result_set(rows: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();

    let mut row_desc = Vec::new();
    row_desc.extend_from_slice(&(2i16).to_be_bytes());
    for name in ["variable_name", "value"] {
        write_cstr(&mut row_desc, name);
        row_desc.extend_from_slice(&0i32.to_be_bytes()); // table oid
        row_desc.extend_from_slice(&0i16.to_be_bytes()); // column attr number
        row_desc.extend_from_slice(&25i32.to_be_bytes()); // type oid: text
        row_desc.extend_from_slice(&(-1i16).to_be_bytes()); // type size: varlena
        row_desc.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        row_desc.extend_from_slice(&0i16.to_be_bytes()); // format: text
    }
    append_message(&mut buf, MSG_ROW_DESCRIPTION, &row_desc);

    for (key, value) in rows {
        let mut row = Vec::new();
        row.extend_from_slice(&(2i16).to_be_bytes());
        for field in [*key, value.as_str()] {
            row.extend_from_slice(&(field.len() as i32).to_be_bytes());
            row.extend_from_slice(field.as_bytes());
        }
        append_message(&mut buf, MSG_DATA_ROW, &row);
    }

    let mut complete = Vec::new();
    write_cstr(&mut complete, &format!("SELECT {}", rows.len()));
    append_message(&mut buf, MSG_COMMAND_COMPLETE, &complete);

    append_message(&mut buf, MSG_READY_FOR_QUERY, b"I");
    buf
}

/// `SELECT * FROM pg_tqdb_status` matched whitespace-insensitively (spec.md
/// §4.F): collapse runs of whitespace and compare case-insensitively.
pub fn is_status_query(sql: &str) -> bool {
    let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.eq_ignore_ascii_case("select * from pg_tqdb_status")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_message() {
        let (mut a, mut b) = duplex(1024);
        write_message(&mut a, b'Q', b"SELECT 1\0").await.unwrap();
        let msg = read_message(&mut b).await.unwrap();
        assert_eq!(msg.tag, b'Q');
        assert_eq!(msg.body, b"SELECT 1\0");
    }

    #[tokio::test]
    async fn recognizes_ssl_request() {
        let (mut a, mut b) = duplex(1024);
        let mut body = Vec::new();
        body.extend_from_slice(&8i32.to_be_bytes());
        body.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        a.write_all(&body).await.unwrap();
        match read_startup(&mut b).await.unwrap() {
            StartupOutcome::SslRequest => {}
            _ => panic!("expected SslRequest"),
        }
    }

    #[tokio::test]
    async fn parses_startup_parameters() {
        let (mut a, mut b) = duplex(1024);
        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
        payload.extend_from_slice(b"user\0alice\0database\0app\0\0");
        let mut msg = Vec::new();
        msg.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        msg.extend_from_slice(&payload);
        a.write_all(&msg).await.unwrap();

        match read_startup(&mut b).await.unwrap() {
            StartupOutcome::Startup { params } => {
                assert_eq!(param(&params, "user").as_deref(), Some("alice"));
                assert_eq!(param(&params, "database").as_deref(), Some("app"));
            }
            _ => panic!("expected Startup"),
        }
    }

    #[test]
    fn status_query_matches_whitespace_insensitively() {
        assert!(is_status_query("select   *   from pg_tqdb_status"));
        assert!(is_status_query("SELECT * FROM PG_TQDB_STATUS"));
        assert!(!is_status_query("SELECT * FROM other_table"));
    }

    #[test]
    fn command_complete_tag_matches_pg_conventions() {
        assert_eq!(command_complete_tag("INSERT", 3), "INSERT 0 3");
        assert_eq!(command_complete_tag("UPDATE", 2), "UPDATE 2");
    }

    #[tokio::test]
    async fn reassembles_simple_query_response_up_to_ready_for_query() {
        let (mut a, mut b) = duplex(4096);
        tokio::spawn(async move {
            write_message(&mut a, MSG_ROW_DESCRIPTION, b"desc").await.unwrap();
            write_message(&mut a, MSG_DATA_ROW, b"row").await.unwrap();
            write_message(&mut a, MSG_COMMAND_COMPLETE, b"SELECT 1\0").await.unwrap();
            write_message(&mut a, MSG_READY_FOR_QUERY, b"I").await.unwrap();
        });
        let raw = read_simple_query_response(&mut b).await.unwrap();
        assert!(!raw.is_empty());
        assert_eq!(*raw.last().unwrap(), b'I');
    }
}
