//! Key → node resolution against the current slot map.

use std::sync::Arc;

use shardpipe_common::key_slot;

use crate::error::{PipelineError, PipelineResult};
use crate::node::Node;
use crate::slot_map::SharedSlotMap;

/// Routes keys to the node owning their hash slot.
///
/// Stateless apart from the shared map handle, so any number of sessions may
/// resolve concurrently.
#[derive(Clone)]
pub struct ConnectionRouter {
    slots: Arc<SharedSlotMap>,
}

impl ConnectionRouter {
    pub fn new(slots: Arc<SharedSlotMap>) -> Self {
        ConnectionRouter { slots }
    }

    /// Resolves `key` to its owning node.
    ///
    /// Fails with `ClusterState` when the slot has no owner, which happens
    /// while slots are being moved between nodes.
    pub fn resolve_node(&self, key: &[u8]) -> PipelineResult<Arc<Node>> {
        let slot = key_slot(key);
        self.slots
            .load()
            .node_for_slot(slot)
            .cloned()
            .ok_or(PipelineError::ClusterState { slot })
    }

    /// Version of the slot map currently used for routing.
    pub fn map_version(&self) -> u64 {
        self.slots.load().version()
    }
}
