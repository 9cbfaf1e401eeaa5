//! Slot ownership shared by the nodes of one simulated cluster.

use parking_lot::RwLock;
use shardpipe_common::{MAX_SLOT, SLOT_COUNT};

/// Which node index owns each slot. Changed at runtime to simulate resharding.
#[derive(Debug)]
pub struct SlotLayout {
    addrs: Vec<String>,
    owners: RwLock<Vec<Option<usize>>>,
}

impl SlotLayout {
    /// Layout with no slot assigned.
    pub fn new(addrs: Vec<String>) -> Self {
        SlotLayout {
            addrs,
            owners: RwLock::new(vec![None; SLOT_COUNT as usize]),
        }
    }

    /// Splits all slots into contiguous, near-equal ranges, one per node.
    pub fn balanced(addrs: Vec<String>) -> Self {
        let layout = Self::new(addrs);
        let nodes = layout.addrs.len();
        if nodes > 0 {
            let per_node = SLOT_COUNT as usize / nodes;
            let mut owners = layout.owners.write();
            for (slot, owner) in owners.iter_mut().enumerate() {
                *owner = Some((slot / per_node.max(1)).min(nodes - 1));
            }
        }
        layout
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn addr(&self, node: usize) -> Option<&str> {
        self.addrs.get(node).map(String::as_str)
    }

    pub fn owner(&self, slot: u16) -> Option<usize> {
        self.owners.read().get(slot as usize).copied().flatten()
    }

    /// Gives `start..=end` to `node`. Out-of-range input is clamped.
    pub fn assign(&self, start: u16, end: u16, node: usize) {
        self.set_range(start, end, Some(node));
    }

    /// Leaves `start..=end` without an owner.
    pub fn unassign(&self, start: u16, end: u16) {
        self.set_range(start, end, None);
    }

    fn set_range(&self, start: u16, end: u16, owner: Option<usize>) {
        let end = end.min(MAX_SLOT);
        if start > end {
            return;
        }
        let mut owners = self.owners.write();
        for slot in start..=end {
            owners[slot as usize] = owner;
        }
    }

    /// Contiguous owned ranges as `(start, end, node)`, ascending.
    pub fn ranges(&self) -> Vec<(u16, u16, usize)> {
        let owners = self.owners.read();
        let mut ranges = Vec::new();
        let mut current: Option<(u16, u16, usize)> = None;
        for (slot, owner) in owners.iter().enumerate() {
            let slot = slot as u16;
            current = match (current, *owner) {
                (Some((start, end, node)), Some(owner)) if owner == node && end + 1 == slot => {
                    Some((start, slot, node))
                }
                (previous, owner) => {
                    if let Some(done) = previous {
                        ranges.push(done);
                    }
                    owner.map(|node| (slot, slot, node))
                }
            };
        }
        if let Some(done) = current {
            ranges.push(done);
        }
        ranges
    }
}
