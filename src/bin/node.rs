//! Node binary

use clap::Parser;
use kvmesh::{common::GossipConfig, Node, NodeConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvmesh-node")]
#[command(about = "kvmesh replicated key-value node")]
#[command(version)]
struct Cli {
    /// TOML config file (flags below take priority)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Node ID
    #[arg(long)]
    id: Option<String>,

    /// Bind address for HTTP (client API and raft traffic)
    #[arg(long)]
    bind: Option<String>,

    /// Address peers use to reach this node
    #[arg(long)]
    advertise: Option<String>,

    /// Data directory
    #[arg(long)]
    data: Option<PathBuf>,

    /// Address of an existing member to join; bootstrap if omitted
    #[arg(long)]
    join: Option<String>,

    /// UDP address for gossip membership
    #[arg(long)]
    gossip: Option<String>,

    /// Gossip seed addresses (comma-separated)
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,
}

impl Cli {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(id) = self.id {
            config.node_id = id;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(advertise) = self.advertise {
            config.advertise_addr = Some(advertise);
        }
        if let Some(data) = self.data {
            config.data_dir = data;
        }
        if let Some(join) = self.join {
            config.join = Some(join);
        }
        if let Some(listen_addr) = self.gossip {
            let gossip = config.gossip.get_or_insert_with(GossipConfig::default);
            gossip.listen_addr = listen_addr;
        }
        if !self.seeds.is_empty() {
            let gossip = config.gossip.get_or_insert_with(GossipConfig::default);
            gossip.seeds = self.seeds;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Node::new(config).serve(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
