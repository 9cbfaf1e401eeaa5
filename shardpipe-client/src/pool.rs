//! # Node Pool
//!
//! Purpose: Bounded, thread-safe set of reusable connections to one node.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connects happen outside the lock on a reserved capacity slot.
//! 3. **Bounded Waiting**: `lease` parks on a condvar until a connection frees
//!    up or the deadline passes, then fails with `PoolExhausted`.
//! 4. **Clean Returns Only**: A connection comes back to the idle list only if
//!    it has no replies in flight and never failed; anything else is evicted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectSettings, Connection};
use crate::error::{PipelineError, PipelineResult};

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Node address.
    pub addr: String,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently leased out.
    pub leased: usize,
    /// Idle + leased + connects in progress.
    pub total: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed because they were broken or not drained.
    pub evicted: u64,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    leased: usize,
}

struct PoolInner {
    addr: String,
    config: PoolConfig,
    settings: ConnectSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    created: AtomicU64,
    evicted: AtomicU64,
}

/// Connection pool for a single node.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

impl NodePool {
    /// Creates an empty pool. Connections are opened lazily on lease.
    pub fn new(addr: impl Into<String>, config: PoolConfig, settings: ConnectSettings) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
            leased: 0,
        };
        NodePool {
            inner: Arc::new(PoolInner {
                addr: addr.into(),
                config,
                settings,
                state: Mutex::new(state),
                available: Condvar::new(),
                created: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Address of the node this pool connects to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Default lease timeout from the pool configuration.
    pub fn lease_timeout(&self) -> Duration {
        self.inner.config.lease_timeout()
    }

    /// Leases a connection, waiting up to `timeout` for one to become free.
    ///
    /// **Logic**:
    /// 1. Pop an idle connection if there is one.
    /// 2. Otherwise reserve capacity and connect outside the lock.
    /// 3. Otherwise wait on the condvar until the deadline.
    pub fn lease(&self, timeout: Duration) -> PipelineResult<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(conn) = state.idle.pop_front() {
                state.leased += 1;
                debug!(addr = %self.inner.addr, conn = conn.id(), "leased idle connection");
                return Ok(PooledConnection::new(self.clone(), conn));
            }

            if state.total < self.inner.config.max_total {
                state.total += 1;
                state.leased += 1;
                drop(state);
                return self.open_reserved();
            }

            if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                // One last look in case a release raced the timeout.
                if state.idle.is_empty() && state.total >= self.inner.config.max_total {
                    return Err(PipelineError::PoolExhausted {
                        node: self.inner.addr.clone(),
                        timeout,
                    });
                }
            }
        }
    }

    fn open_reserved(&self) -> PipelineResult<PooledConnection> {
        match Connection::open(&self.inner.addr, &self.inner.settings) {
            Ok(conn) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(err) => {
                let mut state = self.inner.state.lock();
                state.total = state.total.saturating_sub(1);
                state.leased = state.leased.saturating_sub(1);
                drop(state);
                self.inner.available.notify_one();
                Err(err)
            }
        }
    }

    /// Returns a leased connection.
    ///
    /// A connection with replies still in flight, or one that failed, is
    /// closed instead of re-idled so the next lessee never reads stale data.
    fn release(&self, conn: Connection) {
        let reusable = conn.is_reusable();
        let mut state = self.inner.state.lock();
        state.leased = state.leased.saturating_sub(1);
        if reusable && state.idle.len() < self.inner.config.max_idle {
            debug!(addr = %self.inner.addr, conn = conn.id(), "connection returned");
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
            if !reusable {
                self.inner.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    addr = %self.inner.addr,
                    conn = conn.id(),
                    in_flight = conn.in_flight(),
                    broken = conn.is_broken(),
                    "evicting connection that was not cleanly drained"
                );
            }
            drop(conn);
        }
        drop(state);
        self.inner.available.notify_one();
    }

    /// Returns current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            addr: self.inner.addr.clone(),
            idle: state.idle.len(),
            leased: state.leased,
            total: state.total,
            created: self.inner.created.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
        }
    }
}

/// RAII wrapper returning a connection to its pool on drop.
pub struct PooledConnection {
    pool: NodePool,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: NodePool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // `conn` is only taken in `drop`.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
