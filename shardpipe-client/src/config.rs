//! # Client Configuration
//!
//! Purpose: Describe endpoints, credentials and pool sizing in plain data so an
//! external loader (properties, YAML, environment) can produce it.
//!
//! ## Design Principles
//! 1. **Data Only**: No parsing of files or environment variables happens here;
//!    the types derive `Deserialize` and the loader does the rest.
//! 2. **Sane Defaults**: Every optional field has a default matching the store.
//! 3. **Validate Once**: `validate` rejects unusable input before any socket opens.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

/// Read weight given to a replica when none is configured.
pub const DEFAULT_REPLICA_WEIGHT: u32 = 100;

/// Top-level client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Which topology to connect to.
    pub topology: TopologyConfig,
    /// Per-node pool sizing and timeouts.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Credentials sent with AUTH on every new connection.
    #[serde(default)]
    pub credentials: Credentials,
    /// Logical database selected on connect (standalone only).
    #[serde(default)]
    pub database: u32,
    /// Name reported through CLIENT SETNAME.
    #[serde(default)]
    pub client_name: Option<String>,
}

impl ClientConfig {
    /// Standalone configuration for a single address with default settings.
    pub fn standalone(addr: impl Into<String>) -> Self {
        ClientConfig {
            topology: TopologyConfig::Standalone {
                addr: addr.into(),
                replicas: Vec::new(),
                read_from_replicas: false,
                primary_read_weight: 0,
            },
            pool: PoolConfig::default(),
            credentials: Credentials::default(),
            database: 0,
            client_name: None,
        }
    }

    /// Cluster configuration bootstrapped from the given seed addresses.
    pub fn cluster<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            topology: TopologyConfig::Cluster {
                seeds: seeds.into_iter().map(Into::into).collect(),
            },
            pool: PoolConfig::default(),
            credentials: Credentials::default(),
            database: 0,
            client_name: None,
        }
    }

    /// Rejects configurations that cannot produce a working client.
    pub fn validate(&self) -> PipelineResult<()> {
        self.pool.validate()?;
        match &self.topology {
            TopologyConfig::Standalone { addr, replicas, .. } => {
                if addr.trim().is_empty() {
                    return Err(PipelineError::Config("standalone addr is empty".into()));
                }
                validate_replicas(replicas)
            }
            TopologyConfig::Sentinel {
                sentinels,
                master_name,
                replicas,
                ..
            } => {
                if sentinels.is_empty() {
                    return Err(PipelineError::Config("no sentinels configured".into()));
                }
                if master_name.trim().is_empty() {
                    return Err(PipelineError::Config("sentinel master_name is empty".into()));
                }
                validate_replicas(replicas)
            }
            TopologyConfig::Cluster { seeds } => {
                if seeds.is_empty() {
                    return Err(PipelineError::Config("no cluster seeds configured".into()));
                }
                if self.database != 0 {
                    return Err(PipelineError::Config(
                        "cluster mode only supports database 0".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_replicas(replicas: &[ReplicaConfig]) -> PipelineResult<()> {
    for replica in replicas {
        if replica.addr.trim().is_empty() {
            return Err(PipelineError::Config("replica addr is empty".into()));
        }
    }
    Ok(())
}

/// Topology kind supplied by the configuration resolver.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyConfig {
    /// One primary, optionally with read-only replicas.
    Standalone {
        addr: String,
        #[serde(default)]
        replicas: Vec<ReplicaConfig>,
        #[serde(default)]
        read_from_replicas: bool,
        #[serde(default)]
        primary_read_weight: u32,
    },
    /// Primary discovered through sentinels.
    Sentinel {
        sentinels: Vec<String>,
        master_name: String,
        #[serde(default)]
        replicas: Vec<ReplicaConfig>,
        #[serde(default)]
        read_from_replicas: bool,
        #[serde(default)]
        primary_read_weight: u32,
    },
    /// Sharded cluster discovered from seed nodes.
    Cluster { seeds: Vec<String> },
}

/// Read-only replica with its share of read traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    pub addr: String,
    #[serde(default = "default_replica_weight")]
    pub weight: u32,
}

fn default_replica_weight() -> u32 {
    DEFAULT_REPLICA_WEIGHT
}

/// AUTH credentials. A password without a username uses legacy AUTH.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Pool sizing and timeouts, applied to every node pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum total connections (idle + leased) per node.
    pub max_total: usize,
    /// Maximum idle connections kept per node.
    pub max_idle: usize,
    /// How long `lease` waits for a free connection.
    pub lease_timeout_ms: u64,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Socket read/write timeout; bounds every reply wait.
    pub io_timeout_ms: u64,
}

impl PoolConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.max_total == 0 {
            return Err(PipelineError::Config("pool max_total must be positive".into()));
        }
        if self.io_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(PipelineError::Config("pool timeouts must be positive".into()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 8,
            max_idle: 8,
            lease_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            io_timeout_ms: 2_000,
        }
    }
}
