use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pushy_lite::config::ServerConfig;
use pushy_lite::scheduler::{AllowAll, CommandWhitelist, Whitelist};
use pushy_lite::shutdown::install_shutdown_handler;
use pushy_lite::PushServer;

#[derive(Parser, Debug)]
#[command(name = "pushy-lite")]
#[command(version)]
#[command(about = "Push job server: runs ad-hoc commands on a fleet of nodes after a commit quorum")]
struct Args {
    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:10003")]
    listen: SocketAddr,

    /// JSON file of allowed commands ({"name": "command line"}).
    /// Every command is allowed when omitted.
    #[arg(long)]
    whitelist: Option<PathBuf>,

    /// Heartbeat cadence expected from nodes
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Mark a node offline after this long without a heartbeat
    #[arg(long, default_value = "5000")]
    offline_timeout_ms: u64,

    /// How long a job waits for commit votes
    #[arg(long, default_value = "60000")]
    voting_timeout_ms: u64,

    /// Run timeout for jobs that do not set one
    #[arg(long, default_value = "3600")]
    default_run_timeout_secs: u64,

    /// How long a misbehaving node stays in rehab
    #[arg(long, default_value = "10000")]
    rehab_duration_ms: u64,

    /// Drop node messages whose timestamp is further than this from now
    #[arg(long, default_value = "300")]
    message_window_secs: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            offline_timeout_ms: self.offline_timeout_ms,
            voting_timeout_ms: self.voting_timeout_ms,
            default_run_timeout_secs: self.default_run_timeout_secs,
            rehab_duration_ms: self.rehab_duration_ms,
            message_window_secs: self.message_window_secs,
            whitelist_path: self.whitelist,
        }
    }
}

fn load_whitelist(config: &ServerConfig) -> Result<Arc<dyn Whitelist>, Box<dyn std::error::Error>> {
    match &config.whitelist_path {
        Some(path) => Ok(Arc::new(CommandWhitelist::from_file(path)?)),
        None => {
            tracing::warn!("No command whitelist configured, every command is allowed");
            Ok(Arc::new(AllowAll))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    config.validate()?;
    let whitelist = load_whitelist(&config)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        offline_timeout_ms = config.offline_timeout_ms,
        message_window_secs = config.message_window_secs,
        whitelist = ?config.whitelist_path,
        "Starting pushy-lite server"
    );

    let server = Arc::new(PushServer::new(config, whitelist)?);
    let shutdown = install_shutdown_handler();
    server.run(shutdown).await?;

    Ok(())
}
