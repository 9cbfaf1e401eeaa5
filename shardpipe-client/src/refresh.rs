//! # Topology Refresh
//!
//! Purpose: Reload slot ownership from the cluster and swap the slot map.
//!
//! ## Design Principles
//! 1. **Whole-Map Swap**: The new map is built off to the side and installed
//!    with one pointer store; readers never see a half-updated table.
//! 2. **Coalescing**: Callers that queued behind a reload which completed while
//!    they waited return without reloading again.
//! 3. **Self-Healing**: A failed reload keeps the old map; the next MOVED reply
//!    triggers another attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shardpipe_common::RespValue;
use tracing::{info, warn};

use crate::connection::{ConnectSettings, Connection};
use crate::error::{PipelineError, PipelineResult};
use crate::node::NodeRegistry;
use crate::slot_map::{parse_cluster_slots, SharedSlotMap, SlotMap, SlotRange};

/// Something that can report slot ownership as seen by one node.
pub trait SlotSource: Send + Sync {
    fn fetch(&self, addr: &str) -> PipelineResult<Vec<SlotRange>>;
}

/// Asks a node with `CLUSTER SLOTS` over a fresh, unpooled connection.
pub struct ClusterSlotsSource {
    settings: ConnectSettings,
}

impl ClusterSlotsSource {
    pub fn new(settings: ConnectSettings) -> Self {
        ClusterSlotsSource { settings }
    }
}

impl SlotSource for ClusterSlotsSource {
    fn fetch(&self, addr: &str) -> PipelineResult<Vec<SlotRange>> {
        let mut conn = Connection::open(addr, &self.settings)?;
        let reply = conn.exec(&[b"CLUSTER", b"SLOTS"])?;
        if let RespValue::Error(message) = &reply {
            return Err(PipelineError::from_error_reply(message));
        }
        parse_cluster_slots(&reply, addr)
    }
}

/// Result of a `refresh` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This call fetched and installed a new map.
    Reloaded { version: u64 },
    /// Another caller reloaded while this one waited.
    Coalesced { version: u64 },
}

/// Reloads the shared slot map on demand.
pub struct TopologyRefresher {
    source: Box<dyn SlotSource>,
    registry: Arc<NodeRegistry>,
    slots: Arc<SharedSlotMap>,
    seeds: Vec<String>,
    gate: Mutex<()>,
    generation: AtomicU64,
    reloads: AtomicU64,
}

impl TopologyRefresher {
    pub fn new(
        source: Box<dyn SlotSource>,
        registry: Arc<NodeRegistry>,
        slots: Arc<SharedSlotMap>,
        seeds: Vec<String>,
    ) -> Self {
        TopologyRefresher {
            source,
            registry,
            slots,
            seeds,
            gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
        }
    }

    /// Reloads slot ownership and swaps in the new map.
    ///
    /// **Logic**:
    /// 1. Note the reload generation, then take the gate.
    /// 2. If the generation moved while waiting, someone else already reloaded.
    /// 3. Otherwise ask current owners, then seeds, until one answers.
    /// 4. Build the map, store it, drop nodes that own nothing any more.
    pub fn refresh(&self) -> PipelineResult<RefreshOutcome> {
        let observed = self.generation.load(Ordering::Acquire);
        let _gate = self.gate.lock();
        if self.generation.load(Ordering::Acquire) != observed {
            return Ok(RefreshOutcome::Coalesced {
                version: self.slots.load().version(),
            });
        }

        let current = self.slots.load();
        let mut candidates: Vec<String> =
            current.nodes().iter().map(|node| node.addr().to_string()).collect();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let mut last_err = None;
        for addr in &candidates {
            let ranges = match self.source.fetch(addr) {
                Ok(ranges) if ranges.is_empty() => {
                    warn!(addr = %addr, "node reported no slot ownership");
                    last_err = Some(PipelineError::Topology(format!("{} reported no slots", addr)));
                    continue;
                }
                Ok(ranges) => ranges,
                Err(err) => {
                    warn!(addr = %addr, error = %err, "slot discovery failed");
                    last_err = Some(err);
                    continue;
                }
            };

            let map = SlotMap::from_ranges(current.version() + 1, &ranges, &self.registry)?;
            let version = map.version();
            let owners: Vec<String> = map.nodes().iter().map(|node| node.addr().to_string()).collect();
            let unassigned = map.unassigned_slots();

            self.slots.store(Arc::new(map));
            self.registry.retain(owners.iter().map(String::as_str));
            self.generation.fetch_add(1, Ordering::Release);
            self.reloads.fetch_add(1, Ordering::Relaxed);

            info!(version, nodes = owners.len(), unassigned, source = %addr, "slot map reloaded");
            return Ok(RefreshOutcome::Reloaded { version });
        }

        Err(PipelineError::Topology(match last_err {
            Some(err) => err.to_string(),
            None => "no candidate nodes to ask".to_string(),
        }))
    }

    /// Number of reloads actually performed.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }
}
