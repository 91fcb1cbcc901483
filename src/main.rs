//! SyncRelay Server: real-time event relay
//!
//! Main entry point: parses arguments, loads configuration, initializes
//! logging, and runs the server until a shutdown signal.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use syncrelay_core::config::AppConfig;

/// Command-line arguments. Each flag overrides the loaded configuration.
#[derive(Debug, Parser)]
#[command(name = "syncrelay-server", version, about = "Real-time event sync relay")]
struct Args {
    /// Base configuration file, without extension
    #[arg(long)]
    config: Option<String>,

    /// Environment overlay loaded from `config/{env}.toml`
    #[arg(long, default_value = "development")]
    env: String,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Instance ID used for echo suppression and presence
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_configuration(&args)?;

    init_logging(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %args.env,
        instance_id = %config.sync.instance_id,
        bus = %config.bus.provider,
        "Configuration loaded"
    );

    if let Err(e) = syncrelay_api::run_server(config).await {
        tracing::error!(error = %e, "Server error");
        return Err(e.into());
    }
    Ok(())
}

/// Load configuration from file and environment, then apply CLI overrides.
fn load_configuration(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(args.config.as_deref(), &args.env)?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(instance_id) = &args.instance_id {
        config.sync.instance_id = instance_id.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}
