//! PackSync - Replication Coordinator for a Sharded Key-Value Store
//!
//! Starts the replication endpoint for the configured partitions and,
//! optionally, points every local partition at a master to follow.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use packsync::config::PackSyncConfig;
use packsync::context::ServerContext;
use packsync::error::Result;
use packsync::network::{NetworkServer, TcpReplClient};
use packsync::replication::{PartitionInfo, ReplState, ReplicaManager, RmNode};
use packsync::store::LocalStore;

/// PackSync - Replication Coordinator
#[derive(Parser)]
#[command(name = "packsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "packsync.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the PackSync node
    Start {
        /// Follow this master (`ip:port`) for every local partition
        #[arg(long)]
        follow: Option<String>,
    },

    /// Validate the configuration file and exit
    CheckConfig,
}

fn init_tracing(config: &PackSyncConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PackSyncConfig::from_file(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            println!("configuration ok: {}", cli.config.display());
            Ok(())
        }
        Commands::Start { follow } => {
            init_tracing(&config, cli.log_level.as_deref());
            run_node(config, follow).await
        }
    }
}

async fn run_node(config: PackSyncConfig, follow: Option<String>) -> Result<()> {
    let bind_address = config.node.bind_address.clone();
    let store = Arc::new(LocalStore::from_config(&config));
    let context = ServerContext::new(config, store);

    let server = NetworkServer::new();
    let client = TcpReplClient::new(Arc::clone(&context), Duration::from_secs(5));
    let manager = ReplicaManager::new(
        Arc::clone(&context),
        Arc::clone(&client) as _,
        Arc::clone(&server) as _,
    )?;
    server.set_handler(Arc::clone(&manager) as _);
    client.set_handler(Arc::clone(&manager) as _);

    manager.init_master_terms()?;
    server.start(&bind_address).await?;

    if let Some(master_addr) = follow {
        follow_master(&context, &manager, &master_addr).await?;
    }

    tokio::select! {
        result = manager.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    manager.stop();
    server.stop();
    client.stop().await;
    Ok(())
}

/// Point every local partition at `master_addr` and let the state machine
/// drive the rest
async fn follow_master(
    context: &Arc<ServerContext>,
    manager: &Arc<ReplicaManager>,
    master_addr: &str,
) -> Result<()> {
    let (ip, port) = master_addr
        .rsplit_once(':')
        .and_then(|(ip, port)| Some((ip.to_string(), port.parse::<u16>().ok()?)))
        .ok_or_else(|| {
            packsync::Error::Config(format!("invalid --follow address '{master_addr}'"))
        })?;

    manager.send_meta_sync_request(&ip, port).await?;
    for table in &context.config.tables {
        for id in &table.partition_ids {
            let node = RmNode::new(ip.clone(), port, PartitionInfo::new(&table.name, *id));
            manager
                .activate_sync_slave_partition(&node, ReplState::TryConnect, false)
                .await?;
        }
    }
    tracing::info!("Following master {master_addr}");
    Ok(())
}
