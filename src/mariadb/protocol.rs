//! MariaDB packet framing and response reassembly (spec.md §4.E).
//!
//! Framing is the four-byte header `[len24 | seq8]` followed by `len` bytes
//! of payload; sequence bytes are preserved verbatim end to end, never
//! renumbered by the proxy.

use crate::error::{TqdbError, TqdbResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OK_MARKER: u8 = 0x00;
pub const EOF_MARKER: u8 = 0xFE;
pub const ERR_MARKER: u8 = 0xFF;

/// Read one packet, returning its sequence byte and payload.
pub async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> TqdbResult<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let seq = header[3];
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }
    Ok((seq, payload))
}

/// Write one packet with an explicit sequence byte.
pub async fn write_packet<S: AsyncWrite + Unpin>(
    stream: &mut S,
    seq: u8,
    payload: &[u8],
) -> TqdbResult<()> {
    if payload.len() > 0xFF_FFFF {
        return Err(TqdbError::MalformedPacket(
            "payload exceeds single-packet length limit".into(),
        ));
    }
    let len = payload.len() as u32;
    let header = [
        (len & 0xFF) as u8,
        ((len >> 8) & 0xFF) as u8,
        ((len >> 16) & 0xFF) as u8,
        seq,
    ];
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    Ok(())
}

fn append_packet(buf: &mut Vec<u8>, seq: u8, payload: &[u8]) {
    let len = payload.len() as u32;
    buf.push((len & 0xFF) as u8);
    buf.push(((len >> 8) & 0xFF) as u8);
    buf.push(((len >> 16) & 0xFF) as u8);
    buf.push(seq);
    buf.extend_from_slice(payload);
}

/// Read one full logical response — a terminal OK/ERR/EOF packet, or a
/// column-count byte followed by that many column-definition packets, one
/// EOF, then row packets until EOF or ERR — and return the exact wire bytes
/// (headers included) so the caller can relay them verbatim or store them as
/// a cache value (spec.md §4.E Response reassembly).
pub async fn read_full_response<S: AsyncRead + Unpin>(stream: &mut S) -> TqdbResult<Vec<u8>> {
    let mut buf = Vec::new();
    let (seq0, payload0) = read_packet(stream).await?;
    append_packet(&mut buf, seq0, &payload0);

    match payload0.first() {
        Some(&OK_MARKER) | Some(&ERR_MARKER) | Some(&EOF_MARKER) | None => Ok(buf),
        Some(&col_count) => {
            for _ in 0..col_count {
                let (s, p) = read_packet(stream).await?;
                append_packet(&mut buf, s, &p);
            }
            // terminating EOF after column definitions
            let (s, p) = read_packet(stream).await?;
            append_packet(&mut buf, s, &p);

            loop {
                let (s, p) = read_packet(stream).await?;
                let terminal = matches!(p.first(), Some(&EOF_MARKER) | Some(&ERR_MARKER));
                append_packet(&mut buf, s, &p);
                if terminal {
                    break;
                }
            }
            Ok(buf)
        }
    }
}

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_MARKER)
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_MARKER)
}

fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 1 << 16 {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 1 << 24 {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Build a synthetic OK packet payload (sequence byte supplied by the
/// caller when framing it).
pub fn encode_ok_payload(affected_rows: u64, last_insert_id: u64) -> Vec<u8> {
    let mut payload = vec![OK_MARKER];
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, last_insert_id);
    payload.extend_from_slice(&[0x02, 0x00]); // server status: autocommit
    payload.extend_from_slice(&[0x00, 0x00]); // warning count
    payload
}

pub fn encode_err_payload(code: u16, message: &str) -> Vec<u8> {
    let mut payload = vec![ERR_MARKER];
    payload.extend_from_slice(&code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(b"HY000");
    payload.extend_from_slice(message.as_bytes());
    payload
}

/// Synthesize the two-column `SHOW TQDB STATUS` result set as raw packets,
/// matching the shape `read_full_response` expects to reassemble on a real
/// query: column count, two column-definition stand-ins, EOF, one row per
/// status field, EOF.
pub fn encode_status_result_set(rows: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut seq = 0u8;

    append_packet(&mut buf, seq, &[2]); // column count = 2 (Variable_name, Value)
    seq += 1;

    for name in ["Variable_name", "Value"] {
        let mut col = Vec::new();
        write_lenenc_str(&mut col, "def");
        write_lenenc_str(&mut col, "");
        write_lenenc_str(&mut col, "");
        write_lenenc_str(&mut col, "");
        write_lenenc_str(&mut col, name);
        write_lenenc_str(&mut col, name);
        col.push(0x0c);
        col.extend_from_slice(&[0x21, 0x00]); // utf8 charset
        col.extend_from_slice(&255u32.to_le_bytes()); // column length
        col.push(0xfd); // type: VAR_STRING
        col.extend_from_slice(&[0x00, 0x00]); // flags
        col.push(0x00); // decimals
        col.extend_from_slice(&[0x00, 0x00]); // filler
        append_packet(&mut buf, seq, &col);
        seq += 1;
    }

    append_packet(&mut buf, seq, &[EOF_MARKER, 0x00, 0x00, 0x02, 0x00]);
    seq += 1;

    for (key, value) in rows {
        let mut row = Vec::new();
        write_lenenc_str(&mut row, key);
        write_lenenc_str(&mut row, value);
        append_packet(&mut buf, seq, &row);
        seq += 1;
    }

    append_packet(&mut buf, seq, &[EOF_MARKER, 0x00, 0x00, 0x02, 0x00]);
    buf
}

fn write_lenenc_str(buf: &mut Vec<u8>, s: &str) {
    write_lenenc_int(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Reassemble a `COM_STMT_PREPARE` response: an OK-shaped packet carrying
/// the statement id plus column/parameter counts, followed by that many
/// definition packets (each group terminated by an EOF packet when its
/// count is nonzero). Returns the raw wire bytes for relaying to the client
/// plus the parsed statement id for `ConnectionState.PreparedStatements`.
pub async fn read_prepare_response<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> TqdbResult<(Vec<u8>, u32)> {
    let mut buf = Vec::new();
    let (seq0, payload0) = read_packet(stream).await?;
    append_packet(&mut buf, seq0, &payload0);

    if is_err(&payload0) {
        return Ok((buf, 0));
    }
    if payload0.len() < 9 {
        return Err(TqdbError::MalformedPacket(
            "short COM_STMT_PREPARE OK packet".into(),
        ));
    }
    let stmt_id = u32::from_le_bytes([payload0[1], payload0[2], payload0[3], payload0[4]]);
    let num_columns = u16::from_le_bytes([payload0[5], payload0[6]]);
    let num_params = u16::from_le_bytes([payload0[7], payload0[8]]);

    if num_params > 0 {
        for _ in 0..num_params {
            let (s, p) = read_packet(stream).await?;
            append_packet(&mut buf, s, &p);
        }
        let (s, p) = read_packet(stream).await?;
        append_packet(&mut buf, s, &p);
    }
    if num_columns > 0 {
        for _ in 0..num_columns {
            let (s, p) = read_packet(stream).await?;
            append_packet(&mut buf, s, &p);
        }
        let (s, p) = read_packet(stream).await?;
        append_packet(&mut buf, s, &p);
    }

    Ok((buf, stmt_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_single_packet() {
        let (mut a, mut b) = duplex(1024);
        write_packet(&mut a, 3, b"hello").await.unwrap();
        let (seq, payload) = read_packet(&mut b).await.unwrap();
        assert_eq!(seq, 3);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn reassembles_terminal_ok_packet() {
        let (mut a, mut b) = duplex(1024);
        let ok = encode_ok_payload(1, 42);
        write_packet(&mut a, 1, &ok).await.unwrap();
        let raw = read_full_response(&mut b).await.unwrap();
        // header(4) + payload
        assert_eq!(raw.len(), 4 + ok.len());
        assert!(is_ok(&ok));
    }

    #[tokio::test]
    async fn reassembles_result_set_with_columns_and_rows() {
        let (mut a, mut b) = duplex(4096);
        tokio::spawn(async move {
            write_packet(&mut a, 1, &[1]).await.unwrap(); // 1 column
            write_packet(&mut a, 2, b"coldef").await.unwrap();
            write_packet(&mut a, 3, &[EOF_MARKER, 0, 0]).await.unwrap();
            write_packet(&mut a, 4, b"row1").await.unwrap();
            write_packet(&mut a, 5, b"row2").await.unwrap();
            write_packet(&mut a, 6, &[EOF_MARKER, 0, 0]).await.unwrap();
        });

        let raw = read_full_response(&mut b).await.unwrap();
        // 6 packets of varying payload sizes, each with a 4-byte header.
        let expected_len = 4 + 1 + 4 + 6 + 4 + 3 + 4 + 4 + 4 + 4 + 4 + 3;
        assert_eq!(raw.len(), expected_len);
    }

    #[tokio::test]
    async fn reassembles_prepare_response_with_one_param_and_no_columns() {
        let (mut a, mut b) = duplex(1024);
        tokio::spawn(async move {
            let mut ok = vec![0u8, 7, 0, 0, 0, 0, 0, 1, 0]; // stmt_id=7, cols=0, params=1
            ok[0] = OK_MARKER;
            write_packet(&mut a, 1, &ok).await.unwrap();
            write_packet(&mut a, 2, b"paramdef").await.unwrap();
            write_packet(&mut a, 3, &[EOF_MARKER, 0, 0]).await.unwrap();
        });

        let (_raw, stmt_id) = read_prepare_response(&mut b).await.unwrap();
        assert_eq!(stmt_id, 7);
    }

    #[test]
    fn status_result_set_contains_both_rows() {
        let rows = vec![("Backend", "primary".to_string()), ("Cache_hit", "1".to_string())];
        let buf = encode_status_result_set(&rows);
        assert!(!buf.is_empty());
        let as_str = String::from_utf8_lossy(&buf);
        assert!(as_str.contains("Variable_name"));
        assert!(as_str.contains("Value"));
        assert!(as_str.contains("Backend"));
        assert!(as_str.contains("primary"));
        assert!(as_str.contains("Cache_hit"));
    }
}
