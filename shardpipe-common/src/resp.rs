//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands and replies and parse replies from a blocking
//! reader, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns errors immediately.
//! 5. **Bounded Frames**: Lengths read from the wire are capped before any
//!    allocation, so a bad header is an error and never an abort.

use std::io::{self, BufRead, Read};

use thiserror::Error;

/// Largest bulk string accepted, matching the server's proto-max-bulk-len.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest array accepted.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
/// Deepest array nesting accepted.
pub const MAX_DEPTH: usize = 16;

// Upfront reservation cap; larger payloads grow as bytes actually arrive.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Result type for frame-level operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors raised while reading a RESP2 frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying transport failed, timed out or hit EOF.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Bytes on the wire are not valid RESP2.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Builds a bulk string from any byte-like value.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    /// Returns the integer payload, if this is an integer reply.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the textual payload of simple and bulk strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) => Some(data),
            RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns array items, treating the null array as absent.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "simple string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Bulk(Some(_)) => "bulk string",
            RespValue::Bulk(None) => "nil",
            RespValue::Array(Some(_)) => "array",
            RespValue::Array(None) => "nil array",
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        push_bulk(out, arg);
    }
}

/// Encodes any RESP value, used for writing replies.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(text) => {
            out.push(b'+');
            out.extend_from_slice(text);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(text) => {
            out.push(b'-');
            out.extend_from_slice(text);
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            out.push(b':');
            if *value < 0 {
                out.push(b'-');
            }
            push_u64(out, value.unsigned_abs());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(Some(data)) => push_bulk(out, data),
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.push(b'*');
            push_usize(out, items.len());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> FrameResult<RespValue> {
    read_value(reader, line_buf, 0)
}

fn read_value<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> FrameResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(FrameError::Malformed("empty line"));
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf, depth)
        }
        _ => Err(FrameError::Malformed("unknown type byte")),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> FrameResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len as u64 > MAX_BULK_LEN as u64 {
        return Err(FrameError::Malformed("bulk string exceeds length limit"));
    }
    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside bulk string",
        )));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(FrameError::Malformed("bulk string missing CRLF"));
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> FrameResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Array(None));
    }
    if len as u64 > MAX_ARRAY_LEN as u64 {
        return Err(FrameError::Malformed("array exceeds length limit"));
    }
    if depth >= MAX_DEPTH {
        return Err(FrameError::Malformed("array nesting too deep"));
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len.min(PREALLOC_LIMIT / 64));
    for _ in 0..len {
        items.push(read_value(reader, line_buf, depth + 1)?);
    }
    Ok(RespValue::Array(Some(items)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> FrameResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(FrameError::Malformed("line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> FrameResult<i64> {
    if data.is_empty() {
        return Err(FrameError::Malformed("empty integer"));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(FrameError::Malformed("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_usize(out: &mut Vec<u8>, value: usize) {
    push_u64(out, value as u64);
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> FrameResult<RespValue> {
        let mut reader = Cursor::new(bytes.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line)
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_and_null_bulk() {
        assert_eq!(parse(b"$5\r\nhello\r\n").unwrap(), RespValue::bulk("hello"));
        assert_eq!(parse(b"$-1\r\n").unwrap(), RespValue::Bulk(None));
    }

    #[test]
    fn parses_negative_integer() {
        assert_eq!(parse(b":-2\r\n").unwrap(), RespValue::Integer(-2));
    }

    #[test]
    fn parses_error() {
        assert_eq!(
            parse(b"-MOVED 3999 127.0.0.1:7001\r\n").unwrap(),
            RespValue::Error(b"MOVED 3999 127.0.0.1:7001".to_vec())
        );
    }

    #[test]
    fn parses_nested_array() {
        let value = parse(b"*2\r\n:0\r\n*2\r\n$9\r\n127.0.0.1\r\n:7000\r\n").unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_int(), Some(0));
        assert_eq!(items[1].as_array().unwrap()[0].as_bytes(), Some(&b"127.0.0.1"[..]));
    }

    #[test]
    fn eof_is_an_io_error() {
        assert!(matches!(parse(b""), Err(FrameError::Io(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse(b"?what\r\n"), Err(FrameError::Malformed(_))));
        assert!(matches!(parse(b"+OK\n"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn oversized_headers_are_malformed() {
        assert!(matches!(
            parse(b"$9223372036854775807\r\n"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            parse(b"*4611686018427387904\r\n"),
            Err(FrameError::Malformed(_))
        ));
        let just_over = format!("${}\r\n", MAX_BULK_LEN + 1);
        assert!(matches!(parse(just_over.as_bytes()), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn short_bulk_body_is_eof_not_allocation() {
        // Header within limits, body missing: no upfront allocation of the full length.
        assert!(matches!(parse(b"$1000000\r\nabc"), Err(FrameError::Io(_))));
    }

    #[test]
    fn deep_nesting_is_malformed() {
        let mut frame = Vec::new();
        for _ in 0..=MAX_DEPTH {
            frame.extend_from_slice(b"*1\r\n");
        }
        frame.extend_from_slice(b":1\r\n");
        assert!(matches!(parse(&frame), Err(FrameError::Malformed(_))));

        let mut shallow = Vec::new();
        for _ in 0..MAX_DEPTH {
            shallow.extend_from_slice(b"*1\r\n");
        }
        shallow.extend_from_slice(b":1\r\n");
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn extreme_integers_encode() {
        let mut buf = Vec::new();
        encode_value(&RespValue::Integer(i64::MIN), &mut buf);
        assert_eq!(buf, format!(":{}\r\n", i64::MIN).into_bytes());
    }

    #[test]
    fn encoded_replies_parse_back() {
        let value = RespValue::Array(Some(vec![
            RespValue::Integer(-1),
            RespValue::bulk("v"),
            RespValue::Bulk(None),
            RespValue::Error(b"ERR nope".to_vec()),
        ]));
        let mut buf = Vec::new();
        encode_value(&value, &mut buf);
        assert_eq!(parse(&buf).unwrap(), value);
    }
}
