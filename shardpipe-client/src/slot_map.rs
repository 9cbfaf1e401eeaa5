//! # Slot Map
//!
//! Purpose: Answer "which node owns slot N" for all 16384 slots.
//!
//! ## Design Principles
//! 1. **Immutable Snapshots**: A `SlotMap` never changes after it is built; a
//!    refresh builds a new one and swaps it in whole.
//! 2. **Wait-Free Reads**: `SharedSlotMap::load` clones an `Arc` under a read
//!    lock that writers hold only for a pointer swap, never for a reload.
//! 3. **Direct Indexing**: Slot lookup is one array index, no search.

use std::sync::Arc;

use parking_lot::RwLock;
use shardpipe_common::{RespValue, MAX_SLOT, SLOT_COUNT};

use crate::error::{PipelineError, PipelineResult};
use crate::node::{Node, NodeRegistry};

/// Contiguous slot range owned by one primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: String,
    pub replicas: Vec<String>,
}

/// Versioned slot → node table.
#[derive(Debug)]
pub struct SlotMap {
    version: u64,
    owners: Vec<Option<u16>>,
    nodes: Vec<Arc<Node>>,
}

impl SlotMap {
    /// Map with no owners; every lookup misses.
    pub fn empty() -> Self {
        SlotMap {
            version: 0,
            owners: vec![None; SLOT_COUNT as usize],
            nodes: Vec::new(),
        }
    }

    /// Map where one node owns every slot.
    pub fn single(node: Arc<Node>) -> Self {
        SlotMap {
            version: 1,
            owners: vec![Some(0); SLOT_COUNT as usize],
            nodes: vec![node],
        }
    }

    /// Builds a map from slot ranges, interning primaries through `registry`.
    pub fn from_ranges(
        version: u64,
        ranges: &[SlotRange],
        registry: &NodeRegistry,
    ) -> PipelineResult<Self> {
        let mut owners = vec![None; SLOT_COUNT as usize];
        let mut nodes: Vec<Arc<Node>> = Vec::new();

        for range in ranges {
            if range.start > range.end || range.end > MAX_SLOT {
                return Err(PipelineError::Topology(format!(
                    "invalid slot range {}-{} for {}",
                    range.start, range.end, range.primary
                )));
            }
            let idx = match nodes.iter().position(|node| node.addr() == range.primary) {
                Some(idx) => idx,
                None => {
                    nodes.push(registry.get_or_create(&range.primary));
                    nodes.len() - 1
                }
            };
            for slot in range.start..=range.end {
                owners[slot as usize] = Some(idx as u16);
            }
        }

        Ok(SlotMap {
            version,
            owners,
            nodes,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Owner of `slot`, if any.
    #[inline]
    pub fn node_for_slot(&self, slot: u16) -> Option<&Arc<Node>> {
        self.owners
            .get(slot as usize)
            .copied()
            .flatten()
            .map(|idx| &self.nodes[idx as usize])
    }

    /// Distinct nodes owning at least one slot.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Number of slots without an owner.
    pub fn unassigned_slots(&self) -> usize {
        self.owners.iter().filter(|owner| owner.is_none()).count()
    }
}

/// Holder for the current slot map.
pub struct SharedSlotMap {
    current: RwLock<Arc<SlotMap>>,
}

impl SharedSlotMap {
    pub fn new(map: SlotMap) -> Self {
        SharedSlotMap {
            current: RwLock::new(Arc::new(map)),
        }
    }

    /// Snapshot of the current map.
    #[inline]
    pub fn load(&self) -> Arc<SlotMap> {
        self.current.read().clone()
    }

    /// Replaces the current map.
    pub fn store(&self, map: Arc<SlotMap>) {
        *self.current.write() = map;
    }
}

/// Parses a `CLUSTER SLOTS` reply.
///
/// Each entry is `[start, end, [host, port, id?], replica...]`. An empty host
/// means "the node you asked", so `queried` supplies the host in that case.
pub fn parse_cluster_slots(reply: &RespValue, queried: &str) -> PipelineResult<Vec<SlotRange>> {
    let entries = reply.as_array().ok_or_else(|| {
        PipelineError::ProtocolDecode(format!(
            "CLUSTER SLOTS: expected array, got {}",
            reply.type_name()
        ))
    })?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = entry.as_array().ok_or_else(|| {
            PipelineError::ProtocolDecode("CLUSTER SLOTS: entry is not an array".into())
        })?;
        if items.len() < 3 {
            return Err(PipelineError::ProtocolDecode(
                "CLUSTER SLOTS: entry too short".into(),
            ));
        }
        let start = slot_number(&items[0])?;
        let end = slot_number(&items[1])?;
        let primary = node_addr(&items[2], queried)?;
        let replicas = items[3..]
            .iter()
            .filter_map(|item| node_addr(item, queried).ok())
            .collect();
        ranges.push(SlotRange {
            start,
            end,
            primary,
            replicas,
        });
    }

    ranges.sort_by_key(|range| range.start);
    Ok(ranges)
}

fn slot_number(value: &RespValue) -> PipelineResult<u16> {
    match value.as_int() {
        Some(slot) if (0..=MAX_SLOT as i64).contains(&slot) => Ok(slot as u16),
        _ => Err(PipelineError::ProtocolDecode(
            "CLUSTER SLOTS: invalid slot number".into(),
        )),
    }
}

fn node_addr(value: &RespValue, queried: &str) -> PipelineResult<String> {
    let items = value
        .as_array()
        .filter(|items| items.len() >= 2)
        .ok_or_else(|| PipelineError::ProtocolDecode("CLUSTER SLOTS: bad node entry".into()))?;
    let host = items[0]
        .as_bytes()
        .map(|host| String::from_utf8_lossy(host).into_owned())
        .ok_or_else(|| PipelineError::ProtocolDecode("CLUSTER SLOTS: bad host".into()))?;
    let port = items[1]
        .as_int()
        .ok_or_else(|| PipelineError::ProtocolDecode("CLUSTER SLOTS: bad port".into()))?;

    let host = if host.is_empty() || host == "?" {
        match queried.rsplit_once(':') {
            Some((queried_host, _)) => queried_host.to_string(),
            None => queried.to_string(),
        }
    } else {
        host
    };
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::ConnectSettings;
    use std::time::Duration;

    fn registry() -> NodeRegistry {
        let settings = ConnectSettings {
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            credentials: Default::default(),
            database: 0,
            client_name: None,
        };
        NodeRegistry::new(PoolConfig::default(), settings)
    }

    fn node_entry(host: &str, port: i64) -> RespValue {
        RespValue::Array(Some(vec![RespValue::bulk(host), RespValue::Integer(port)]))
    }

    fn range(start: u16, end: u16, primary: &str) -> SlotRange {
        SlotRange {
            start,
            end,
            primary: primary.to_string(),
            replicas: Vec::new(),
        }
    }

    #[test]
    fn parses_cluster_slots_reply() {
        let reply = RespValue::Array(Some(vec![
            RespValue::Array(Some(vec![
                RespValue::Integer(8192),
                RespValue::Integer(16383),
                node_entry("", 7001),
            ])),
            RespValue::Array(Some(vec![
                RespValue::Integer(0),
                RespValue::Integer(8191),
                node_entry("127.0.0.1", 7000),
                node_entry("127.0.0.1", 7100),
            ])),
        ]));

        let ranges = parse_cluster_slots(&reply, "10.1.1.1:7001").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].primary, "127.0.0.1:7000");
        assert_eq!(ranges[0].replicas, vec!["127.0.0.1:7100".to_string()]);
        assert_eq!(ranges[1].primary, "10.1.1.1:7001");
    }

    #[test]
    fn rejects_malformed_cluster_slots() {
        assert!(parse_cluster_slots(&RespValue::Integer(1), "a:1").is_err());
        let bad_slot = RespValue::Array(Some(vec![RespValue::Array(Some(vec![
            RespValue::Integer(0),
            RespValue::Integer(20_000),
            node_entry("h", 1),
        ]))]));
        assert!(parse_cluster_slots(&bad_slot, "a:1").is_err());
    }

    #[test]
    fn builds_lookup_from_ranges() {
        let registry = registry();
        let map = SlotMap::from_ranges(
            7,
            &[range(0, 100, "a:1"), range(101, 200, "b:1"), range(201, 300, "a:1")],
            &registry,
        )
        .unwrap();

        assert_eq!(map.version(), 7);
        assert_eq!(map.nodes().len(), 2);
        assert_eq!(map.node_for_slot(0).unwrap().addr(), "a:1");
        assert_eq!(map.node_for_slot(150).unwrap().addr(), "b:1");
        assert_eq!(map.node_for_slot(250).unwrap().addr(), "a:1");
        assert!(map.node_for_slot(301).is_none());
        assert_eq!(map.unassigned_slots(), SLOT_COUNT as usize - 301);
    }

    #[test]
    fn shared_map_swaps_whole_snapshots() {
        let registry = registry();
        let shared = SharedSlotMap::new(SlotMap::empty());
        let before = shared.load();

        let next = SlotMap::from_ranges(1, &[range(0, MAX_SLOT, "a:1")], &registry).unwrap();
        shared.store(Arc::new(next));

        assert!(before.node_for_slot(5).is_none());
        assert_eq!(shared.load().node_for_slot(5).unwrap().addr(), "a:1");
        assert_eq!(shared.load().unassigned_slots(), 0);
    }
}
