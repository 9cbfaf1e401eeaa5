//! # Client API
//!
//! Purpose: One blocking surface for one-shot commands and pipelined batches,
//! whether the backend is a single primary or a sharded cluster.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `PipelineClient` hides topology, pooling and protocol.
//! 2. **Mode-Agnostic**: Callers never branch on standalone versus cluster.
//! 3. **One Path**: One-shot commands run as a single-operation session, so
//!    they share every guarantee pipelines have.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{ClientConfig, TopologyConfig};
use crate::connection::ConnectSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::node::NodeRegistry;
use crate::operation::{KeyTtl, Operation, Reply, SetCondition};
use crate::pool::PoolStats;
use crate::refresh::ClusterSlotsSource;
use crate::sentinel;
use crate::session::{PipelineSession, Routing};
use crate::topology::{ClusteredTopology, Mode, StandaloneTopology, Topology};

/// Thread-safe client; clones share topology and pools.
#[derive(Clone)]
pub struct PipelineClient {
    topology: Arc<dyn Topology>,
}

impl PipelineClient {
    /// Builds a client from configuration.
    ///
    /// Cluster mode discovers slot ownership before returning; sentinel mode
    /// resolves the current primary first.
    pub fn connect(config: ClientConfig) -> PipelineResult<Self> {
        config.validate()?;
        let settings = ConnectSettings::from_config(&config);
        let registry = Arc::new(NodeRegistry::new(config.pool.clone(), settings.clone()));
        let lease_timeout = config.pool.lease_timeout();

        let topology: Arc<dyn Topology> = match config.topology {
            TopologyConfig::Standalone {
                addr,
                replicas,
                read_from_replicas,
                primary_read_weight,
            } => Arc::new(StandaloneTopology::new(
                registry,
                &addr,
                &replicas,
                read_from_replicas,
                primary_read_weight,
                lease_timeout,
            )),
            TopologyConfig::Sentinel {
                sentinels,
                master_name,
                replicas,
                read_from_replicas,
                primary_read_weight,
            } => {
                let addr = sentinel::resolve_master(&sentinels, &master_name, &settings)?;
                Arc::new(StandaloneTopology::new(
                    registry,
                    &addr,
                    &replicas,
                    read_from_replicas,
                    primary_read_weight,
                    lease_timeout,
                ))
            }
            TopologyConfig::Cluster { seeds } => {
                let source = Box::new(ClusterSlotsSource::new(settings));
                Arc::new(ClusteredTopology::connect(
                    registry,
                    seeds,
                    source,
                    lease_timeout,
                )?)
            }
        };

        info!(mode = ?topology.mode(), version = topology.map_version(), "client ready");
        Ok(Self::with_topology(topology))
    }

    /// Wraps an already-built topology.
    pub fn with_topology(topology: Arc<dyn Topology>) -> Self {
        PipelineClient { topology }
    }

    pub fn mode(&self) -> Mode {
        self.topology.mode()
    }

    /// Opens a pipeline session. Every operation in it goes to the primary
    /// that owns its key.
    pub fn begin_pipeline(&self) -> PipelineSession {
        PipelineSession::new(self.topology.clone(), Routing::Primary)
    }

    /// Runs one operation and returns its decoded reply.
    ///
    /// Read-only commands may be served by a weighted replica.
    pub fn execute(&self, op: Operation) -> PipelineResult<Reply> {
        let mut session = PipelineSession::new(self.topology.clone(), Routing::ReadBalanced);
        session.enqueue(op)?;
        session
            .sync_and_collect()?
            .pop()
            .ok_or_else(|| PipelineError::ProtocolDecode("missing reply".into()))
    }

    /// GET key. Returns `None` when the key is missing.
    pub fn get(&self, key: &[u8]) -> PipelineResult<Option<Vec<u8>>> {
        self.execute(Operation::get(key))?.into_value()
    }

    /// SET key value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> PipelineResult<()> {
        self.execute(Operation::set(key, value))?.into_done()
    }

    /// SET key value PX <ttl>.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> PipelineResult<()> {
        self.execute(Operation::set_with_ttl(key, value, ttl))?.into_done()
    }

    /// SET guarded by an `NX`/`XX` condition, with an optional expiry.
    /// Returns whether the value was stored.
    pub fn set_with_condition(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> PipelineResult<bool> {
        self.execute(Operation::set_if(key, value, ttl, condition))?
            .as_flag()
    }

    /// Put-if-absent. Returns false when the key already held a value.
    pub fn set_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> PipelineResult<bool> {
        self.set_with_condition(key, value, ttl, SetCondition::IfAbsent)
    }

    /// Values of `keys`, in order, with `None` for missing keys.
    ///
    /// Sent as one pipeline of single-key GETs, so keys in different slots
    /// never share a command.
    pub fn mget<K: AsRef<[u8]>>(&self, keys: &[K]) -> PipelineResult<Vec<Option<Vec<u8>>>> {
        let mut session = self.begin_pipeline();
        for key in keys {
            session.get(key.as_ref())?;
        }
        session
            .sync_and_collect()?
            .into_iter()
            .map(Reply::into_value)
            .collect()
    }

    /// Deletes every key in one pipeline of single-key DELs. Returns how many
    /// keys were removed.
    pub fn delete_many<K: AsRef<[u8]>>(&self, keys: &[K]) -> PipelineResult<u64> {
        let mut session = self.begin_pipeline();
        for key in keys {
            session.delete(key.as_ref())?;
        }
        let mut removed = 0;
        for reply in session.sync_and_collect()? {
            removed += reply.as_count()?.max(0) as u64;
        }
        Ok(removed)
    }

    /// DEL key. Returns whether a key was removed.
    pub fn delete(&self, key: &[u8]) -> PipelineResult<bool> {
        Ok(self.execute(Operation::delete(key))?.as_count()? > 0)
    }

    pub fn exists(&self, key: &[u8]) -> PipelineResult<bool> {
        self.execute(Operation::exists(key))?.as_flag()
    }

    /// EXPIRE key <secs>. Returns whether the timeout was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> PipelineResult<bool> {
        self.execute(Operation::expire(key, ttl))?.as_flag()
    }

    pub fn ttl(&self, key: &[u8]) -> PipelineResult<KeyTtl> {
        match self.execute(Operation::ttl(key))? {
            Reply::Ttl(ttl) => Ok(ttl),
            other => Err(PipelineError::ProtocolDecode(format!(
                "expected ttl reply, got {:?}",
                other
            ))),
        }
    }

    pub fn incr(&self, key: &[u8]) -> PipelineResult<i64> {
        self.execute(Operation::incr(key))?.as_count()
    }

    pub fn decr(&self, key: &[u8]) -> PipelineResult<i64> {
        self.execute(Operation::decr(key))?.as_count()
    }

    /// Forces a topology reload. A no-op for standalone backends.
    pub fn refresh_topology(&self) -> PipelineResult<()> {
        self.topology.refresh()
    }

    /// Version of the routing table in use.
    pub fn topology_version(&self) -> u64 {
        self.topology.map_version()
    }

    /// Pool counters for every known node, sorted by address.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.topology.pool_stats()
    }
}
