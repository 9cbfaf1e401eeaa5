use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use shardpipe_devnode::Deployment;

/// In-memory Redis-compatible node(s) for local development.
#[derive(Parser, Debug)]
#[command(name = "shardpipe-devnode", version)]
struct Cli {
    /// Address to bind every node on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port of the first node; further cluster nodes use the following ports.
    #[arg(long, default_value_t = 7000)]
    port: u16,
    /// Number of cluster nodes.
    #[arg(long, default_value_t = 3)]
    nodes: usize,
    /// Run a single standalone node instead of a cluster.
    #[arg(long)]
    standalone: bool,
    /// Require AUTH with this password.
    #[arg(long)]
    password: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut deployment = if cli.standalone {
        Deployment::standalone(&cli.host, cli.port)?
    } else {
        Deployment::cluster(&cli.host, cli.port, cli.nodes)?
    };
    if let Some(password) = &cli.password {
        deployment = deployment.with_password(password);
    }

    for addr in deployment.addrs() {
        info!(addr = %addr, "node bound");
    }
    deployment
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await?;
    info!("dev nodes stopped");
    Ok(())
}
