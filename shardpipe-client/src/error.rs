//! # Error Taxonomy
//!
//! Every fallible client call returns [`PipelineResult`]. Redirections are
//! parsed into a structured [`Redirect`] so the topology layer can act on them.

use std::fmt;
use std::io;
use std::time::Duration;

use shardpipe_common::FrameError;
use thiserror::Error;

/// Result type for the pipelining client.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced across the client boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The slot map has no owner for the key's slot (mid-resharding gap).
    #[error("cluster state error: slot {slot} has no owner")]
    ClusterState { slot: u16 },
    /// No connection to `node` became available before the lease timeout.
    #[error("connection pool for {node} exhausted after {timeout:?}")]
    PoolExhausted { node: String, timeout: Duration },
    /// The node answered with MOVED or ASK.
    #[error("redirection: {0}")]
    Redirection(Redirect),
    /// Transport failure, timeout or unexpected EOF.
    #[error("connection io error: {0}")]
    ConnectionIo(#[from] io::Error),
    /// Reply framing was invalid or did not match the command.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),
    /// The node answered with an error reply other than a redirection.
    #[error("server error: {0}")]
    Server(String),
    /// The session no longer accepts operations.
    #[error("pipeline session is closed")]
    SessionClosed,
    /// Topology discovery failed on every candidate node.
    #[error("topology discovery failed: {0}")]
    Topology(String),
    /// The supplied configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Classifies an error reply from the server.
    pub fn from_error_reply(message: &[u8]) -> Self {
        let text = String::from_utf8_lossy(message);
        match Redirect::parse(&text) {
            Some(redirect) => PipelineError::Redirection(redirect),
            None => PipelineError::Server(text.into_owned()),
        }
    }

    /// True when the error leaves the wire in an unknown position, so the
    /// connection that produced it must not be reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            PipelineError::ConnectionIo(_) | PipelineError::ProtocolDecode(_)
        )
    }
}

impl From<FrameError> for PipelineError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => PipelineError::ConnectionIo(err),
            FrameError::Malformed(reason) => PipelineError::ProtocolDecode(reason.to_string()),
        }
    }
}

/// Redirection flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// The slot permanently moved; the slot map is stale.
    Moved,
    /// The slot is migrating; only this one request should go elsewhere.
    Ask,
}

/// Parsed `MOVED <slot> <host:port>` / `ASK <slot> <host:port>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub address: String,
}

impl Redirect {
    /// Parses an error message such as "MOVED 3999 127.0.0.1:7001".
    pub fn parse(message: &str) -> Option<Self> {
        let mut parts = message.split_whitespace();
        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let slot: u16 = parts.next()?.parse().ok()?;
        let address = parts.next()?;
        if !address.contains(':') {
            return None;
        }
        Some(Redirect {
            kind,
            slot,
            address: address.to_string(),
        })
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RedirectKind::Moved => "MOVED",
            RedirectKind::Ask => "ASK",
        };
        write!(f, "{} {} {}", kind, self.slot, self.address)
    }
}
