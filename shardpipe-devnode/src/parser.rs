//! # Request Parser
//!
//! Purpose: Split an inbound byte stream into commands, one argument vector
//! per request, without consuming bytes until a request is complete.
//!
//! ## Design Principles
//! 1. **Incremental**: A partial request leaves the buffer untouched and
//!    yields `None`; the caller reads more and tries again.
//! 2. **Pipelining**: Several requests in one read are returned one by one.
//! 3. **Bounded**: Oversized counts, lengths and lines are protocol errors.

use bytes::{Buf, BytesMut};

/// Largest accepted bulk argument.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest accepted argument count.
const MAX_ARGS: usize = 1024 * 1024;
/// Longest header or inline line accepted before giving up on finding CRLF.
const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// Bytes on the wire are not a valid request.
    Protocol,
}

/// Stateless between calls; all progress lives in the caller's buffer.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one request from the front of `buf`.
    ///
    /// Returns `Ok(Some(args))` and advances past the request when a whole
    /// request is present. Inline requests (plain text lines) are accepted
    /// for interactive use.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'*' {
            return parse_inline(buf);
        }

        let (count, mut pos) = match read_int_line(buf, 1)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if count <= 0 {
            buf.advance(pos);
            return Ok(Some(Vec::new()));
        }
        let count = count as usize;
        if count > MAX_ARGS {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            if pos >= buf.len() {
                return Ok(None);
            }
            if buf[pos] != b'$' {
                return Err(RespError::Protocol);
            }
            let (len, start) = match read_int_line(buf, pos + 1)? {
                Some(header) => header,
                None => return Ok(None),
            };
            if len < 0 || len as usize > MAX_BULK_LEN {
                return Err(RespError::Protocol);
            }
            let end = start + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[start..end].to_vec());
            pos = end + 2;
        }

        buf.advance(pos);
        Ok(Some(args))
    }
}

fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    let newline = match buf.iter().position(|&b| b == b'\n') {
        Some(idx) => idx,
        None if buf.len() > MAX_LINE_LEN => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    let line = &buf[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let args = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_vec())
        .collect();
    buf.advance(newline + 1);
    Ok(Some(args))
}

/// Reads a signed decimal terminated by CRLF starting at `start`.
///
/// Returns the value and the index just past the CRLF.
fn read_int_line(buf: &[u8], start: usize) -> Result<Option<(i64, usize)>, RespError> {
    let rest = &buf[start..];
    let cr = match rest.windows(2).position(|pair| pair == b"\r\n") {
        Some(idx) => idx,
        None if rest.len() > MAX_LINE_LEN => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    let value = std::str::from_utf8(&rest[..cr])
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(RespError::Protocol)?;
    Ok(Some((value, start + cr + 2)))
}
