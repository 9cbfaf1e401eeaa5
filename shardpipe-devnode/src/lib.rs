//! # Shardpipe Dev Node
//!
//! Purpose: In-memory Redis-compatible nodes for local development and
//! integration tests, able to act as a standalone primary, a member of a
//! sharded cluster, or a sentinel.
//!
//! ## Design Principles
//! 1. **Async I/O**: One tokio task per connection; requests are parsed
//!    incrementally from a `BytesMut` buffer.
//! 2. **Pipelining**: Every complete request in a read is answered in order.
//! 3. **Observable**: Per-node counters show which node served what.

pub mod cluster;
pub mod layout;
pub mod metrics;
pub mod parser;
pub mod server;
pub mod store;

pub use cluster::{Deployment, DevCluster};
pub use layout::SlotLayout;
pub use metrics::{Metrics, MetricsSnapshot};
pub use parser::{RespError, RespParser};
pub use server::{handle_connection, serve_until, NodeContext, Role};
pub use store::{Keyspace, StoreError, TtlStatus};
