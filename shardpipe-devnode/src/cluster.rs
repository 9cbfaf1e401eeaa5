//! # Deployments and Test Harness
//!
//! Purpose: Bind a set of dev nodes (cluster, standalone or sentinel), serve
//! them on a tokio runtime, and let tests reshape slot ownership while the
//! nodes run.
//!
//! ## Design Principles
//! 1. **Bind Before Serve**: Listeners are bound synchronously, so addresses
//!    are known and connectable before the runtime starts.
//! 2. **Shared Keyspace**: Nodes of one cluster share data; moving a slot
//!    only changes who answers for it.
//! 3. **Scoped Lifetime**: `DevCluster` stops its runtime on drop.

use std::future::Future;
use std::net::TcpListener as StdTcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use shardpipe_common::key_slot;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::layout::SlotLayout;
use crate::metrics::MetricsSnapshot;
use crate::server::{self, NodeContext, Role, STANDALONE_DATABASES};
use crate::store::Keyspace;

/// Bound but not yet serving nodes.
pub struct Deployment {
    listeners: Vec<StdTcpListener>,
    nodes: Vec<NodeContext>,
    layout: Option<Arc<SlotLayout>>,
}

impl Deployment {
    /// `count` cluster members on consecutive ports from `base_port`, or on
    /// ephemeral ports when `base_port` is 0. Slots are split evenly.
    pub fn cluster(host: &str, base_port: u16, count: usize) -> Result<Self> {
        if count == 0 {
            bail!("a cluster needs at least one node");
        }
        let listeners = bind_all(host, base_port, count)?;
        let addrs = local_addrs(&listeners)?;
        let layout = Arc::new(SlotLayout::balanced(addrs.clone()));
        let keyspace = Arc::new(Keyspace::new());
        let nodes = addrs
            .into_iter()
            .enumerate()
            .map(|(index, addr)| {
                NodeContext::new(
                    addr,
                    Role::ClusterMember {
                        index,
                        layout: Arc::clone(&layout),
                    },
                    vec![Arc::clone(&keyspace)],
                )
            })
            .collect();
        Ok(Deployment {
            listeners,
            nodes,
            layout: Some(layout),
        })
    }

    /// One standalone node with its own logical databases.
    pub fn standalone(host: &str, port: u16) -> Result<Self> {
        let listeners = bind_all(host, port, 1)?;
        let addr = local_addrs(&listeners)?.remove(0);
        let databases = (0..STANDALONE_DATABASES)
            .map(|_| Arc::new(Keyspace::new()))
            .collect();
        Ok(Deployment {
            listeners,
            nodes: vec![NodeContext::new(addr, Role::Standalone, databases)],
            layout: None,
        })
    }

    /// One sentinel reporting `master_addr` as the primary of `master_name`.
    pub fn sentinel(host: &str, port: u16, master_name: &str, master_addr: &str) -> Result<Self> {
        let listeners = bind_all(host, port, 1)?;
        let addr = local_addrs(&listeners)?.remove(0);
        let role = Role::Sentinel {
            master_name: master_name.to_string(),
            master_addr: master_addr.to_string(),
        };
        Ok(Deployment {
            listeners,
            nodes: vec![NodeContext::new(addr, role, Vec::new())],
            layout: None,
        })
    }

    /// Requires AUTH on every node.
    pub fn with_password(mut self, password: &str) -> Self {
        self.nodes = self
            .nodes
            .into_iter()
            .map(|node| node.with_password(password))
            .collect();
        self
    }

    pub fn addrs(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.addr().to_string()).collect()
    }

    /// Serves every node on the current runtime until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let nodes = self.nodes.into_iter().map(Arc::new).collect();
        serve_nodes(self.listeners, nodes, shutdown).await
    }
}

async fn serve_nodes<F>(
    listeners: Vec<StdTcpListener>,
    nodes: Vec<Arc<NodeContext>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(nodes.len());
    for (listener, ctx) in listeners.into_iter().zip(nodes) {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let mut stop = stop_rx.clone();
        tasks.push(tokio::spawn(server::serve_until(listener, ctx, async move {
            let _ = stop.changed().await;
        })));
    }

    shutdown.await;
    let _ = stop_tx.send(true);
    for task in tasks {
        task.await??;
    }
    Ok(())
}

/// Running deployment on a private runtime thread, for tests.
pub struct DevCluster {
    nodes: Vec<Arc<NodeContext>>,
    layout: Option<Arc<SlotLayout>>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DevCluster {
    /// `count` cluster members on ephemeral localhost ports.
    pub fn start(count: usize) -> Result<Self> {
        Self::launch(Deployment::cluster("127.0.0.1", 0, count)?)
    }

    /// One standalone node on an ephemeral localhost port.
    pub fn start_standalone() -> Result<Self> {
        Self::launch(Deployment::standalone("127.0.0.1", 0)?)
    }

    /// One sentinel pointing `master_name` at `master_addr`.
    pub fn start_sentinel(master_name: &str, master_addr: &str) -> Result<Self> {
        Self::launch(Deployment::sentinel("127.0.0.1", 0, master_name, master_addr)?)
    }

    /// Serves `deployment` on a background thread with its own runtime.
    pub fn launch(deployment: Deployment) -> Result<Self> {
        let Deployment {
            listeners,
            nodes,
            layout,
        } = deployment;
        let nodes: Vec<Arc<NodeContext>> = nodes.into_iter().map(Arc::new).collect();
        let served = nodes.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);

        let thread = thread::Builder::new()
            .name("devnode-runtime".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let stopped = runtime.block_on(serve_nodes(listeners, served, async move {
                    let _ = shutdown_rx.await;
                }));
                if let Err(err) = stopped {
                    warn!(error = %err, "dev cluster stopped with error");
                }
            })
            .context("spawning dev cluster thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => bail!("dev cluster runtime failed to start: {}", message),
            Err(_) => bail!("dev cluster thread exited during startup"),
        }
        debug!(nodes = nodes.len(), "dev cluster started");

        Ok(DevCluster {
            nodes,
            layout,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addrs(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.addr().to_string()).collect()
    }

    pub fn addr(&self, node: usize) -> &str {
        self.nodes[node].addr()
    }

    /// Gives slots `start..=end` to `node`. No-op outside cluster mode.
    pub fn assign(&self, start: u16, end: u16, node: usize) {
        if let Some(layout) = &self.layout {
            layout.assign(start, end, node);
        }
    }

    /// Leaves slots `start..=end` unowned. No-op outside cluster mode.
    pub fn unassign(&self, start: u16, end: u16) {
        if let Some(layout) = &self.layout {
            layout.unassign(start, end);
        }
    }

    /// Moves the slot of `key` to `node`, returning the slot.
    pub fn move_key(&self, key: &[u8], node: usize) -> u16 {
        let slot = key_slot(key);
        self.assign(slot, slot, node);
        slot
    }

    /// Node currently owning `key`'s slot; always 0 outside cluster mode.
    pub fn owner_of(&self, key: &[u8]) -> Option<usize> {
        match &self.layout {
            Some(layout) => layout.owner(key_slot(key)),
            None => Some(0),
        }
    }

    pub fn metrics(&self, node: usize) -> MetricsSnapshot {
        self.nodes[node].metrics().snapshot()
    }

    /// Stops the runtime and closes every connection. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DevCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_all(host: &str, base_port: u16, count: usize) -> Result<Vec<StdTcpListener>> {
    (0..count)
        .map(|offset| {
            let port = if base_port == 0 {
                0
            } else {
                base_port
                    .checked_add(offset as u16)
                    .context("port range overflows")?
            };
            StdTcpListener::bind((host, port)).with_context(|| format!("binding {}:{}", host, port))
        })
        .collect()
}

fn local_addrs(listeners: &[StdTcpListener]) -> Result<Vec<String>> {
    listeners
        .iter()
        .map(|listener| Ok(listener.local_addr()?.to_string()))
        .collect()
}
