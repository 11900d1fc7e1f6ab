//! vdrived: VaultDrive device daemon
//!
//! Usage:
//!   vdrived [--config /etc/vdrive/vdrive.toml]
//!
//! Runs the firmware core on a host: block devices are backed by image
//! files, the BLE UART and the USB bulk endpoints by Unix sockets.

mod device;
mod disk;
mod transport;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use vdrive_core::config::VdriveConfig;

#[derive(Parser, Debug)]
#[command(name = "vdrived", version, about = "VaultDrive device daemon")]
struct Cli {
    /// Path to vdrive.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "VDRIVE_CONFIG",
        default_value = "/etc/vdrive/vdrive.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "VDRIVE_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "VDRIVE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "vdrived starting"
    );

    let config = load_config(&cli.config).await?;

    device::run(config).await
}

async fn load_config(path: &PathBuf) -> Result<VdriveConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(VdriveConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
