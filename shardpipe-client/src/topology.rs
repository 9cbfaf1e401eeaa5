//! # Topology
//!
//! Purpose: Hide whether the backend is one primary or a sharded cluster
//! behind a single key → node interface.
//!
//! ## Design Principles
//! 1. **Chosen Once**: The variant is picked when the client is built; request
//!    paths never branch on configuration.
//! 2. **Same Session Code**: Sessions drive either variant through the trait.
//! 3. **Redirect Handling Lives Here**: Only the clustered variant reacts to
//!    MOVED by reloading its slot map.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ReplicaConfig;
use crate::error::{PipelineResult, RedirectKind, Redirect};
use crate::node::{Node, NodeRegistry};
use crate::pool::PoolStats;
use crate::read_balance::ReadBalancer;
use crate::refresh::{RefreshOutcome, SlotSource, TopologyRefresher};
use crate::router::ConnectionRouter;
use crate::slot_map::{SharedSlotMap, SlotMap};

/// Deployment shape behind a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Clustered,
}

/// Key → node resolution plus the reactions a session needs.
pub trait Topology: Send + Sync {
    fn mode(&self) -> Mode;

    /// Node that must serve writes (and pipelined reads) for `key`.
    fn resolve(&self, key: &[u8]) -> PipelineResult<Arc<Node>>;

    /// Node that serves a one-shot read of `key`.
    fn resolve_read(&self, key: &[u8]) -> PipelineResult<Arc<Node>> {
        self.resolve(key)
    }

    /// Called after a session surfaced a redirection reply.
    fn on_redirect(&self, redirect: &Redirect);

    /// How long a session waits for a pooled connection.
    fn lease_timeout(&self) -> Duration;

    /// Forces a topology reload where one exists.
    fn refresh(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Version of the routing table in use.
    fn map_version(&self) -> u64;

    fn pool_stats(&self) -> Vec<PoolStats>;
}

/// One primary owning the whole keyspace.
pub struct StandaloneTopology {
    primary: Arc<Node>,
    reads: Option<ReadBalancer>,
    registry: Arc<NodeRegistry>,
    lease_timeout: Duration,
}

impl StandaloneTopology {
    /// Builds the topology. Replica reads are enabled only when
    /// `read_from_replicas` is set and at least one weight is non-zero.
    pub fn new(
        registry: Arc<NodeRegistry>,
        primary_addr: &str,
        replicas: &[ReplicaConfig],
        read_from_replicas: bool,
        primary_read_weight: u32,
        lease_timeout: Duration,
    ) -> Self {
        let primary = registry.get_or_create(primary_addr);
        let reads = if read_from_replicas && !replicas.is_empty() {
            let mut choices = vec![(primary.clone(), primary_read_weight)];
            for replica in replicas {
                choices.push((registry.get_or_create(&replica.addr), replica.weight));
            }
            ReadBalancer::new(choices)
        } else {
            None
        };
        debug!(
            primary = %primary_addr,
            replicas = replicas.len(),
            balanced_reads = reads.is_some(),
            "standalone topology ready"
        );
        StandaloneTopology {
            primary,
            reads,
            registry,
            lease_timeout,
        }
    }
}

impl Topology for StandaloneTopology {
    fn mode(&self) -> Mode {
        Mode::Standalone
    }

    fn resolve(&self, _key: &[u8]) -> PipelineResult<Arc<Node>> {
        Ok(self.primary.clone())
    }

    fn resolve_read(&self, _key: &[u8]) -> PipelineResult<Arc<Node>> {
        match &self.reads {
            Some(balancer) => Ok(balancer.pick().clone()),
            None => Ok(self.primary.clone()),
        }
    }

    fn on_redirect(&self, redirect: &Redirect) {
        warn!(%redirect, "standalone node answered with a redirection");
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn map_version(&self) -> u64 {
        1
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        self.registry.stats()
    }
}

/// Sharded cluster routed by hash slot.
pub struct ClusteredTopology {
    router: ConnectionRouter,
    refresher: TopologyRefresher,
    registry: Arc<NodeRegistry>,
    lease_timeout: Duration,
}

impl ClusteredTopology {
    /// Discovers slot ownership through `source` and returns a ready topology.
    ///
    /// Fails with `Topology` when no seed answers.
    pub fn connect(
        registry: Arc<NodeRegistry>,
        seeds: Vec<String>,
        source: Box<dyn SlotSource>,
        lease_timeout: Duration,
    ) -> PipelineResult<Self> {
        let slots = Arc::new(SharedSlotMap::new(SlotMap::empty()));
        let refresher = TopologyRefresher::new(source, registry.clone(), slots.clone(), seeds);
        refresher.refresh()?;
        Ok(ClusteredTopology {
            router: ConnectionRouter::new(slots),
            refresher,
            registry,
            lease_timeout,
        })
    }

    /// Reloads performed since startup, the initial discovery included.
    pub fn reload_count(&self) -> u64 {
        self.refresher.reload_count()
    }
}

impl Topology for ClusteredTopology {
    fn mode(&self) -> Mode {
        Mode::Clustered
    }

    fn resolve(&self, key: &[u8]) -> PipelineResult<Arc<Node>> {
        self.router.resolve_node(key)
    }

    fn on_redirect(&self, redirect: &Redirect) {
        if redirect.kind == RedirectKind::Ask {
            // ASK is a one-off for an in-progress migration; the map is still right.
            debug!(%redirect, "ASK redirection surfaced without reload");
            return;
        }
        match self.refresher.refresh() {
            Ok(RefreshOutcome::Reloaded { version }) => {
                debug!(%redirect, version, "slot map reloaded after MOVED")
            }
            Ok(RefreshOutcome::Coalesced { version }) => {
                debug!(%redirect, version, "slot map already reloaded by another caller")
            }
            Err(err) => warn!(%redirect, error = %err, "slot map reload after MOVED failed"),
        }
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn refresh(&self) -> PipelineResult<()> {
        self.refresher.refresh().map(|_| ())
    }

    fn map_version(&self) -> u64 {
        self.router.map_version()
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        self.registry.stats()
    }
}
