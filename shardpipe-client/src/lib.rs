//! # Shardpipe Client
//!
//! Purpose: Pipeline key-addressed commands against a standalone or sharded
//! Redis-compatible backend, routing each key to the node that owns its slot
//! and reading replies back in enqueue order.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per node; a session
//!    leases at most one per node.
//! 2. **Snapshot Routing**: Slot maps are immutable and swapped whole.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Clean Pools**: A connection only re-enters its pool with nothing in
//!    flight.

mod client;
mod config;
mod connection;
mod drain;
mod error;
mod node;
mod operation;
mod pool;
mod read_balance;
mod refresh;
mod router;
mod sentinel;
mod session;
mod slot_map;
mod topology;

pub use client::PipelineClient;
pub use config::{
    ClientConfig, Credentials, PoolConfig, ReplicaConfig, TopologyConfig, DEFAULT_REPLICA_WEIGHT,
};
pub use connection::{ConnectSettings, Connection};
pub use error::{PipelineError, PipelineResult, Redirect, RedirectKind};
pub use node::{Node, NodeRegistry};
pub use operation::{Command, KeyTtl, Operation, OperationHandle, Reply, SetCondition};
pub use pool::{NodePool, PoolStats, PooledConnection};
pub use read_balance::ReadBalancer;
pub use refresh::{ClusterSlotsSource, RefreshOutcome, SlotSource, TopologyRefresher};
pub use router::ConnectionRouter;
pub use sentinel::resolve_master;
pub use session::{PipelineSession, SessionState};
pub use slot_map::{parse_cluster_slots, SharedSlotMap, SlotMap, SlotRange};
pub use topology::{ClusteredTopology, Mode, StandaloneTopology, Topology};
