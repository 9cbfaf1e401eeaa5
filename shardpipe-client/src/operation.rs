//! # Operations and Replies
//!
//! Purpose: Describe key-addressed commands, encode them for the wire and
//! decode their replies into typed values.
//!
//! ## Design Principles
//! 1. **Key First**: Every operation carries exactly one routing key.
//! 2. **Typed Replies**: Callers match on `Reply`, never on raw RESP.
//! 3. **Strict Decoding**: A reply whose shape does not fit the command is a
//!    protocol decode error, not a silent default.

use std::time::Duration;

use shardpipe_common::RespValue;

use crate::error::{PipelineError, PipelineResult};

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Existence precondition of a SET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// `NX`: only store when the key is missing.
    IfAbsent,
    /// `XX`: only store when the key already exists.
    IfPresent,
}

impl SetCondition {
    fn flag(self) -> &'static [u8] {
        match self {
            SetCondition::IfAbsent => b"NX",
            SetCondition::IfPresent => b"XX",
        }
    }
}

/// Command kind plus its non-key arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get,
    /// SET, optionally with a millisecond expiry (`PX`) and an `NX`/`XX`
    /// condition.
    Set {
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: Option<SetCondition>,
    },
    Delete,
    Exists,
    /// Key timeout, sent as `PEXPIRE` in milliseconds.
    Expire { ttl: Duration },
    Ttl,
    Incr,
    Decr,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get => "GET",
            Command::Set { .. } => "SET",
            Command::Delete => "DEL",
            Command::Exists => "EXISTS",
            Command::Expire { .. } => "PEXPIRE",
            Command::Ttl => "TTL",
            Command::Incr => "INCR",
            Command::Decr => "DECR",
        }
    }

    /// Whether the command may be served by a read-only replica.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Command::Get | Command::Exists | Command::Ttl)
    }

    /// Decodes the reply to this command.
    ///
    /// Error replies become `Redirection` or `Server`; shape mismatches become
    /// `ProtocolDecode`.
    pub fn decode(&self, reply: RespValue) -> PipelineResult<Reply> {
        if let RespValue::Error(message) = &reply {
            return Err(PipelineError::from_error_reply(message));
        }
        let decoded = match (self, &reply) {
            (Command::Get, RespValue::Bulk(data)) => Some(Reply::Value(data.clone())),
            (Command::Set { condition: None, .. }, RespValue::Simple(_)) => Some(Reply::Done),
            // A conditional SET answers +OK when stored and nil when skipped.
            (Command::Set { condition: Some(_), .. }, RespValue::Simple(_)) => {
                Some(Reply::Flag(true))
            }
            (Command::Set { condition: Some(_), .. }, RespValue::Bulk(None)) => {
                Some(Reply::Flag(false))
            }
            (Command::Delete, RespValue::Integer(count))
            | (Command::Incr, RespValue::Integer(count))
            | (Command::Decr, RespValue::Integer(count)) => Some(Reply::Count(*count)),
            (Command::Exists, RespValue::Integer(count)) => Some(Reply::Flag(*count > 0)),
            (Command::Expire { .. }, RespValue::Integer(value)) => Some(Reply::Flag(*value == 1)),
            (Command::Ttl, RespValue::Integer(value)) => match *value {
                -2 => Some(Reply::Ttl(KeyTtl::Missing)),
                -1 => Some(Reply::Ttl(KeyTtl::NoExpiry)),
                secs if secs >= 0 => {
                    Some(Reply::Ttl(KeyTtl::ExpiresIn(Duration::from_secs(secs as u64))))
                }
                _ => None,
            },
            _ => None,
        };
        decoded.ok_or_else(|| {
            PipelineError::ProtocolDecode(format!(
                "unexpected {} reply to {}",
                reply.type_name(),
                self.name()
            ))
        })
    }
}

/// One key-addressed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub key: Vec<u8>,
    pub command: Command,
}

impl Operation {
    pub fn new(key: impl Into<Vec<u8>>, command: Command) -> Self {
        Operation {
            key: key.into(),
            command,
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Get)
    }

    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(
            key,
            Command::Set {
                value: value.into(),
                ttl: None,
                condition: None,
            },
        )
    }

    pub fn set_with_ttl(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self::new(
            key,
            Command::Set {
                value: value.into(),
                ttl: Some(ttl),
                condition: None,
            },
        )
    }

    /// SET guarded by `condition`; replies `Flag(stored)`.
    pub fn set_if(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> Self {
        Self::new(
            key,
            Command::Set {
                value: value.into(),
                ttl,
                condition: Some(condition),
            },
        )
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Delete)
    }

    pub fn exists(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Exists)
    }

    pub fn expire(key: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self::new(key, Command::Expire { ttl })
    }

    pub fn ttl(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Ttl)
    }

    pub fn incr(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Incr)
    }

    pub fn decr(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Command::Decr)
    }

    /// Calls `f` with the RESP argument list for this operation.
    ///
    /// Numeric arguments are formatted into stack buffers, so no allocation
    /// happens beyond the argument slice itself.
    pub fn with_args<R>(&self, f: impl FnOnce(&[&[u8]]) -> R) -> R {
        let name = self.command.name().as_bytes();
        let key = self.key.as_slice();
        match &self.command {
            Command::Set {
                value,
                ttl,
                condition,
            } => {
                let (digits, digits_len) = match ttl {
                    Some(ttl) => encode_u64(ttl_millis(*ttl)),
                    None => ([0u8; 20], 0),
                };
                let mut args: [&[u8]; 6] = [name, key, value.as_slice(), &[], &[], &[]];
                let mut len = 3;
                if ttl.is_some() {
                    args[len] = b"PX";
                    args[len + 1] = &digits[..digits_len];
                    len += 2;
                }
                if let Some(condition) = condition {
                    args[len] = condition.flag();
                    len += 1;
                }
                f(&args[..len])
            }
            Command::Expire { ttl } => {
                let (digits, len) = encode_u64(ttl_millis(*ttl));
                f(&[name, key, &digits[..len]])
            }
            _ => f(&[name, key]),
        }
    }
}

/// Decoded reply, in the same position as its operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// GET result; `None` when the key is missing.
    Value(Option<Vec<u8>>),
    /// +OK acknowledgement.
    Done,
    /// Integer result (DEL count, INCR/DECR value).
    Count(i64),
    /// Boolean result (EXISTS, EXPIRE).
    Flag(bool),
    /// TTL result.
    Ttl(KeyTtl),
}

impl Reply {
    /// Consumes a `Value` reply.
    pub fn into_value(self) -> PipelineResult<Option<Vec<u8>>> {
        match self {
            Reply::Value(value) => Ok(value),
            other => Err(mismatch("value", &other)),
        }
    }

    /// Checks for a plain `Done` acknowledgement.
    pub fn into_done(self) -> PipelineResult<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(mismatch("done", &other)),
        }
    }

    pub fn as_count(&self) -> PipelineResult<i64> {
        match self {
            Reply::Count(count) => Ok(*count),
            other => Err(mismatch("count", other)),
        }
    }

    pub fn as_flag(&self) -> PipelineResult<bool> {
        match self {
            Reply::Flag(flag) => Ok(*flag),
            other => Err(mismatch("flag", other)),
        }
    }
}

fn mismatch(wanted: &str, got: &Reply) -> PipelineError {
    PipelineError::ProtocolDecode(format!("expected {} reply, got {:?}", wanted, got))
}

/// Position of an enqueued operation within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationHandle(pub(crate) usize);

impl OperationHandle {
    /// Index into the `Vec<Reply>` returned by `sync_and_collect`.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Whole milliseconds, rounded up so a sub-millisecond TTL still leaves the
/// key alive, and clamped for durations beyond `u64::MAX` ms.
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if Duration::from_millis(millis) < ttl {
        millis.saturating_add(1)
    } else {
        millis.max(1)
    }
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
