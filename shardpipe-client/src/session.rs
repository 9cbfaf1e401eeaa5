//! # Pipeline Session
//!
//! Purpose: Batch key-addressed operations across many nodes, writing each
//! request immediately and reading every reply back in enqueue order.
//!
//! ## Design Principles
//! 1. **One Lease Per Node**: The session holds at most one connection per
//!    node, leased on first use and kept until the session closes.
//! 2. **Global Order**: Replies are resolved in the order operations were
//!    enqueued, whichever node served them.
//! 3. **Clean Return**: Every lease is drained before it goes back to its
//!    pool; whatever could not be drained is evicted by the pool.
//! 4. **Always Closes**: `sync` ends in `Closed` whether or not it failed, and
//!    dropping an open session closes it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::drain::ResponseDrain;
use crate::error::{PipelineError, PipelineResult};
use crate::node::Node;
use crate::operation::{Command, Operation, OperationHandle, Reply};
use crate::pool::PooledConnection;
use crate::topology::Topology;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting operations.
    Open,
    /// Replies are being read back.
    Draining,
    /// All leases released; no further operations accepted.
    Closed,
}

/// Which node a read-only operation goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routing {
    /// Always the owning primary.
    Primary,
    /// Read-only commands may go to a weighted replica.
    ReadBalanced,
}

/// Connection leased for one node.
pub(crate) struct Lease {
    pub(crate) node: Arc<Node>,
    pub(crate) conn: PooledConnection,
}

/// An operation whose request is on the wire and whose reply is unread.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub(crate) seq: usize,
    pub(crate) lease: usize,
    pub(crate) command: Command,
}

/// Single-driver batch of pipelined operations.
///
/// Obtained from `PipelineClient::begin_pipeline`. Not shareable between
/// threads at the same time; every method takes `&mut self`.
pub struct PipelineSession {
    topology: Arc<dyn Topology>,
    routing: Routing,
    leases: Vec<Lease>,
    by_addr: HashMap<String, usize>,
    queue: Vec<PendingOperation>,
    state: SessionState,
    dirty: bool,
}

impl PipelineSession {
    pub(crate) fn new(topology: Arc<dyn Topology>, routing: Routing) -> Self {
        PipelineSession {
            topology,
            routing,
            leases: Vec::new(),
            by_addr: HashMap::new(),
            queue: Vec::new(),
            state: SessionState::Open,
            dirty: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Operations enqueued and not yet synced.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True when requests were written since the session opened.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Addresses of the nodes this session currently holds a lease on.
    pub fn leased_nodes(&self) -> Vec<&str> {
        self.leases.iter().map(|lease| lease.node.addr()).collect()
    }

    /// Makes sure the session holds a lease on `node` and returns the id of
    /// the leased connection. Calling it again for the same node returns the
    /// same id. The connection itself stays private to the session, so only
    /// `enqueue` writes to it and only the drain reads from it.
    ///
    /// Fails with `SessionClosed` outside `Open` and with `PoolExhausted`
    /// when the node's pool has nothing free before the lease timeout.
    pub fn lease_for(&mut self, node: &Arc<Node>) -> PipelineResult<u64> {
        self.ensure_open()?;
        let idx = self.lease_index(node)?;
        Ok(self.leases[idx].conn.id())
    }

    fn lease_index(&mut self, node: &Arc<Node>) -> PipelineResult<usize> {
        if let Some(&idx) = self.by_addr.get(node.addr()) {
            return Ok(idx);
        }
        let conn = node.pool().lease(self.topology.lease_timeout())?;
        debug!(addr = %node.addr(), conn = conn.id(), "session leased connection");
        self.leases.push(Lease {
            node: node.clone(),
            conn,
        });
        let idx = self.leases.len() - 1;
        self.by_addr.insert(node.addr().to_string(), idx);
        Ok(idx)
    }

    /// Writes `op` to its node without waiting for the reply.
    ///
    /// **Logic**:
    /// 1. Resolve the owning node from the key.
    /// 2. Reuse or take the session's lease for that node.
    /// 3. Write the request and remember where its reply will arrive.
    pub fn enqueue(&mut self, op: Operation) -> PipelineResult<OperationHandle> {
        self.ensure_open()?;
        let node = match self.routing {
            Routing::ReadBalanced if op.command.is_read_only() => {
                self.topology.resolve_read(&op.key)?
            }
            _ => self.topology.resolve(&op.key)?,
        };
        let lease = self.lease_index(&node)?;
        let conn = &mut self.leases[lease].conn;
        op.with_args(|args| conn.send(args))?;

        let seq = self.queue.len();
        self.queue.push(PendingOperation {
            seq,
            lease,
            command: op.command,
        });
        self.dirty = true;
        Ok(OperationHandle(seq))
    }

    pub fn get(&mut self, key: impl Into<Vec<u8>>) -> PipelineResult<OperationHandle> {
        self.enqueue(Operation::get(key))
    }

    pub fn set(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> PipelineResult<OperationHandle> {
        self.enqueue(Operation::set(key, value))
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        ttl: std::time::Duration,
    ) -> PipelineResult<OperationHandle> {
        self.enqueue(Operation::set_with_ttl(key, value, ttl))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> PipelineResult<OperationHandle> {
        self.enqueue(Operation::delete(key))
    }

    /// Reads every reply, checks it, and closes the session.
    pub fn sync(&mut self) -> PipelineResult<()> {
        self.finish(None)
    }

    /// Like `sync`, returning one decoded reply per enqueued operation, in
    /// enqueue order.
    pub fn sync_and_collect(&mut self) -> PipelineResult<Vec<Reply>> {
        let mut replies = Vec::with_capacity(self.queue.len());
        self.finish(Some(&mut replies))?;
        Ok(replies)
    }

    fn finish(&mut self, sink: Option<&mut Vec<Reply>>) -> PipelineResult<()> {
        self.ensure_open()?;
        self.state = SessionState::Draining;

        let outcome = ResponseDrain::new(&mut self.leases, &self.queue).run(sink);
        debug!(
            ops = self.queue.len(),
            nodes = self.leases.len(),
            resolved = outcome.resolved,
            discarded = outcome.discarded,
            "pipeline drained"
        );

        // Release before reloading so the refresh never waits behind our leases.
        self.close();
        if let Some(PipelineError::Redirection(redirect)) = &outcome.error {
            warn!(%redirect, "pipeline hit a redirection");
            self.topology.on_redirect(redirect);
        }
        outcome.into_result()
    }

    /// Discards unread replies and releases every lease. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let mut discarded = 0;
        for mut lease in self.leases.drain(..) {
            if lease.conn.in_flight() > 0 {
                discarded += lease.conn.discard_pending();
            }
            debug!(addr = %lease.node.addr(), conn = lease.conn.id(), "session released connection");
        }
        if discarded > 0 {
            debug!(discarded, "discarded unread replies on close");
        }
        self.by_addr.clear();
        self.queue.clear();
        self.dirty = false;
        self.state = SessionState::Closed;
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        match self.state {
            SessionState::Open => Ok(()),
            _ => Err(PipelineError::SessionClosed),
        }
    }
}

impl Drop for PipelineSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::ConnectSettings;
    use crate::node::NodeRegistry;
    use crate::topology::StandaloneTopology;
    use std::time::Duration;

    fn session() -> PipelineSession {
        session_at("127.0.0.1:1")
    }

    fn session_at(addr: &str) -> PipelineSession {
        let settings = ConnectSettings {
            connect_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(200),
            credentials: Default::default(),
            database: 0,
            client_name: None,
        };
        let registry = Arc::new(NodeRegistry::new(PoolConfig::default(), settings));
        let topology =
            StandaloneTopology::new(registry, addr, &[], false, 0, Duration::from_millis(50));
        PipelineSession::new(Arc::new(topology), Routing::Primary)
    }

    #[test]
    fn empty_sync_closes() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.sync_and_collect().unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_dirty());
    }

    #[test]
    fn closed_session_rejects_work() {
        let mut session = session();
        session.close();
        session.close();
        assert!(matches!(session.get("k"), Err(PipelineError::SessionClosed)));
        assert!(matches!(session.sync(), Err(PipelineError::SessionClosed)));
    }

    #[test]
    fn failed_lease_leaves_session_open() {
        let mut session = session();
        // Port 1 refuses connections, so the lease fails before anything is written.
        assert!(matches!(session.get("k"), Err(PipelineError::ConnectionIo(_))));
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.is_empty());
        assert!(session.leased_nodes().is_empty());
    }

    #[test]
    fn lease_for_reuses_the_session_lease() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut session = session_at(&listener.local_addr().unwrap().to_string());
        let node = session.topology.resolve(b"k").unwrap();

        let first = session.lease_for(&node).unwrap();
        let second = session.lease_for(&node).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.leased_nodes().len(), 1);
        assert_eq!(node.pool().stats().leased, 1);
        assert!(session.is_empty());

        session.close();
        assert_eq!(node.pool().stats().leased, 0);
        assert!(matches!(session.lease_for(&node), Err(PipelineError::SessionClosed)));
    }
}
