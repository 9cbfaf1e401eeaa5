//! Weighted selection of the node that serves a one-shot read.

use std::sync::Arc;

use rand::Rng;

use crate::node::Node;

/// Picks a read node proportionally to configured weights.
///
/// A node with weight 0 never serves reads. Construction fails when every
/// weight is 0, in which case callers read from the primary.
#[derive(Debug)]
pub struct ReadBalancer {
    choices: Vec<(Arc<Node>, u32)>,
    total: u64,
}

impl ReadBalancer {
    pub fn new(choices: Vec<(Arc<Node>, u32)>) -> Option<Self> {
        let choices: Vec<(Arc<Node>, u32)> =
            choices.into_iter().filter(|(_, weight)| *weight > 0).collect();
        let total: u64 = choices.iter().map(|(_, weight)| *weight as u64).sum();
        if total == 0 {
            return None;
        }
        Some(ReadBalancer { choices, total })
    }

    /// Picks a node at random, weighted.
    pub fn pick(&self) -> &Arc<Node> {
        let roll = rand::thread_rng().gen_range(0..self.total);
        self.pick_with(roll)
    }

    /// Deterministic pick for a roll in `0..total_weight()`.
    pub fn pick_with(&self, roll: u64) -> &Arc<Node> {
        let mut upper = 0u64;
        for (node, weight) in &self.choices {
            upper += *weight as u64;
            if roll < upper {
                return node;
            }
        }
        // Rolls past the end clamp to the last choice.
        &self.choices[self.choices.len() - 1].0
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::ConnectSettings;
    use std::time::Duration;

    fn node(addr: &str) -> Arc<Node> {
        let settings = ConnectSettings {
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            credentials: Default::default(),
            database: 0,
            client_name: None,
        };
        Arc::new(Node::new(addr, PoolConfig::default(), settings))
    }

    #[test]
    fn picks_by_cumulative_weight() {
        let balancer =
            ReadBalancer::new(vec![(node("p:1"), 10), (node("r:1"), 0), (node("r:2"), 30)]).unwrap();
        assert_eq!(balancer.total_weight(), 40);
        assert_eq!(balancer.pick_with(0).addr(), "p:1");
        assert_eq!(balancer.pick_with(9).addr(), "p:1");
        assert_eq!(balancer.pick_with(10).addr(), "r:2");
        assert_eq!(balancer.pick_with(39).addr(), "r:2");
    }

    #[test]
    fn all_zero_weights_disable_balancing() {
        assert!(ReadBalancer::new(vec![(node("p:1"), 0)]).is_none());
        assert!(ReadBalancer::new(Vec::new()).is_none());
    }

    #[test]
    fn random_picks_respect_zero_weights() {
        let balancer = ReadBalancer::new(vec![(node("p:1"), 0), (node("r:1"), 5)]).unwrap();
        for _ in 0..100 {
            assert_eq!(balancer.pick().addr(), "r:1");
        }
    }
}
