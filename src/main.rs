//! Stormgr - Cluster Membership Coordinator
//!
//! Daemon that keeps a node in its storage cluster and serves the admin API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stormgr::api::HttpServer;
use stormgr::cluster::{self, Deps};
use stormgr::config::{StoreBackend, StormgrConfig};
use stormgr::error::Result;
use stormgr::listener::LoggingListener;
use stormgr::network::TcpTransport;
use stormgr::state::StateTracker;
use stormgr::store::{ClusterStore, KvStore, MemoryKv, SqliteKv};

/// Stormgr - Cluster Membership Coordinator
#[derive(Parser)]
#[command(name = "stormgr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "stormgr.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and join (or bootstrap) its cluster
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stormgr.toml")]
        output: PathBuf,

        /// Node ID (random when omitted)
        #[arg(long)]
        node_id: Option<String>,

        /// Cluster ID
        #[arg(long, default_value = "storage")]
        cluster_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config)?;
            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_start(config).await
        }
        Commands::Init { output, node_id, cluster_id } => {
            run_init(output, node_id, cluster_id)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Info => {
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> Result<StormgrConfig> {
    StormgrConfig::from_file(path).map_err(|e| {
        eprintln!("Failed to load configuration from {:?}: {}", path, e);
        e
    })
}

/// Start the node
async fn run_start(config: StormgrConfig) -> Result<()> {
    tracing::info!("Starting stormgr node {} in cluster {}", config.node.id, config.cluster.id);

    if let Err(e) = std::fs::create_dir_all(config.state_dir()) {
        tracing::error!("Failed to create state directory {:?}: {}", config.state_dir(), e);
        return Err(e.into());
    }

    // Shared cluster store
    let kv: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config.store_path();
            tracing::info!("Using SQLite cluster store at {:?}", path);
            match SqliteKv::open(&path, config.poll_interval()) {
                Ok(kv) => Arc::new(kv),
                Err(e) => {
                    tracing::error!("Failed to open cluster store {:?}: {}", path, e);
                    return Err(e);
                }
            }
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-process cluster store; other nodes cannot see this cluster");
            Arc::new(MemoryKv::new())
        }
    };

    let state = match StateTracker::new(config.state_dir(), config.node.id.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to initialize state tracker: {}", e);
            return Err(e);
        }
    };

    // Probes time out on their own; keep connection attempts inside one probe
    let probe_timeout = Duration::from_millis(config.cluster.probe_timeout_ms);
    let transport = Arc::new(TcpTransport::new(
        config.node.bind_address.clone(),
        probe_timeout,
        probe_timeout * 4,
    ));

    let deps = Deps {
        store: ClusterStore::new(kv),
        state,
        transport,
    };

    let manager = cluster::new(config.cluster_config(), deps).await?;
    manager.add_event_listener(Arc::new(LoggingListener))?;
    tracing::info!("Cluster manager initialized ({})", manager.state());

    cluster::start().await?;
    tracing::info!("Node {} started", manager.node_id());

    // Admin API
    let (api_stop_tx, api_stop_rx) = tokio::sync::watch::channel(false);
    let api_handle = if config.api.enabled {
        let server = HttpServer::new(
            config.api.clone(),
            config.node.id.clone(),
            Arc::new(manager.clone()),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = server.start(api_stop_rx).await {
                tracing::error!("HTTP API error: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = manager.wait_stopped() => {
            tracing::info!("Cluster manager stopped");
        }
    }

    let result = manager.shutdown(false, &[]).await;
    if let Err(e) = &result {
        tracing::error!("Failed to leave the cluster cleanly: {}", e);
    }

    let _ = api_stop_tx.send(true);
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }
    cluster::uninstall();

    tracing::info!("Node {} stopped", config.node.id);
    result
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>, cluster_id: String) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));
    let config_content = format!(r#"# Stormgr Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:9010"
data_dir = "/var/lib/stormgr"
# advertise_address = "my-public-ip:9010"

[cluster]
id = "{cluster_id}"
heartbeat_interval_ms = 1000
probe_timeout_ms = 500
suspect_after_misses = 3
removal_grace_ms = 30000
cas_max_attempts = 10
cas_backoff_base_ms = 50
cas_backoff_max_ms = 2000
watch_retry_ms = 1000
store_failure_threshold = 5

[store]
backend = "sqlite"
# path = "/shared/stormgr/cluster.db"
poll_interval_ms = 500

[api]
enabled = true
bind_address = "0.0.0.0:9080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster and store settings.");
    println!("Then start with: stormgr --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match StormgrConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Cluster ID: {}", config.cluster.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Store: {:?} ({})", config.store.backend, config.store_path().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = StormgrConfig::from_file(&config_path)?;

    println!("Stormgr Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Cluster ID:     {}", config.cluster.id);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  Probe Timeout:  {} ms", config.cluster.probe_timeout_ms);
    println!("  Suspect After:  {} misses", config.cluster.suspect_after_misses);
    println!("  Removal Grace:  {} ms", config.cluster.removal_grace_ms);
    println!();
    println!("Store Configuration:");
    println!("  Backend:        {:?}", config.store.backend);
    println!("  Path:           {}", config.store_path().display());
    println!();
    println!("API:              {} ({})",
        config.api.bind_address,
        if config.api.enabled { "enabled" } else { "disabled" });

    Ok(())
}
