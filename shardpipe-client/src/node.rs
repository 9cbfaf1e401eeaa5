//! # Nodes
//!
//! A [`Node`] is a logical endpoint: an address plus the one [`NodePool`] that
//! serves it. The [`NodeRegistry`] interns nodes by address so that a topology
//! refresh reuses existing pools (and their warm connections) instead of
//! building new ones.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::ConnectSettings;
use crate::pool::{NodePool, PoolStats};

/// Logical store endpoint.
#[derive(Debug)]
pub struct Node {
    addr: String,
    pool: NodePool,
}

impl Node {
    pub fn new(addr: impl Into<String>, pool_config: PoolConfig, settings: ConnectSettings) -> Self {
        let addr = addr.into();
        let pool = NodePool::new(addr.clone(), pool_config, settings);
        Node { addr, pool }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }
}

/// Address-keyed table of nodes shared by a client and its refresher.
pub struct NodeRegistry {
    pool_config: PoolConfig,
    settings: ConnectSettings,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new(pool_config: PoolConfig, settings: ConnectSettings) -> Self {
        NodeRegistry {
            pool_config,
            settings,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the node for `addr`, creating it (and its pool) on first use.
    pub fn get_or_create(&self, addr: &str) -> Arc<Node> {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(addr) {
            return node.clone();
        }
        debug!(addr, "registering node");
        let node = Arc::new(Node::new(addr, self.pool_config.clone(), self.settings.clone()));
        nodes.insert(addr.to_string(), node.clone());
        node
    }

    /// Drops nodes whose address is not in `keep`.
    ///
    /// Sessions still holding a removed node keep its pool alive through their
    /// own `Arc` until they close.
    pub fn retain<'a>(&self, keep: impl IntoIterator<Item = &'a str>) {
        let keep: Vec<&str> = keep.into_iter().collect();
        self.nodes
            .lock()
            .retain(|addr, _| keep.iter().any(|kept| *kept == addr.as_str()));
    }

    /// Stats of every registered pool, sorted by address.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .nodes
            .lock()
            .values()
            .map(|node| node.pool().stats())
            .collect();
        stats.sort_by(|a, b| a.addr.cmp(&b.addr));
        stats
    }
}
