//! imaged-worker: the ImAged backend process
//!
//! Started by the front end with piped standard streams. stdout carries the
//! encrypted protocol only; all logging goes to stderr.
//!
//! Usage:
//!   imaged-worker [--config ~/.config/imaged/config.toml] [--rsa-bits 2048]

mod service;
mod settings;
mod thumbnail;

use anyhow::{Context, Result};
use clap::Parser;
use imaged_core::config::{expand_tilde, ImagedConfig};
use imaged_crypto::{load_master_key, WorkerIdentity};
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::{info, warn};

use crate::service::ImageService;
use crate::settings::SettingsStore;

#[derive(Parser, Debug)]
#[command(name = "imaged-worker", version, about = "ImAged secure backend worker")]
struct Cli {
    /// Path to imaged config file
    #[arg(
        long,
        short = 'c',
        env = "IMAGED_CONFIG",
        default_value = "~/.config/imaged/config.toml"
    )]
    config: PathBuf,

    /// RSA modulus size for the handshake key (overrides worker.rsa_bits)
    #[arg(long)]
    rsa_bits: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: logging.level, else info]
    #[arg(long, env = "IMAGED_LOG")]
    log: Option<String>,

    /// Log format [default: logging.format, else text]
    #[arg(long, env = "IMAGED_LOG_FORMAT", value_parser = ["json", "text"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings live in the config, so it is read before a subscriber exists
    let config_path = expand_tilde(&cli.config);
    let config_found = config_path.exists();
    let config = ImagedConfig::load(&config_path).await?;
    init_logging(
        config.logging.level_or(cli.log.as_deref(), "info"),
        config.logging.json_output(cli.log_format.as_deref()),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        config = %config_path.display(),
        "imaged-worker starting"
    );
    if !config_found {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    let master_key_path = config.ttl.master_key_file.as_deref().map(expand_tilde);
    let master = load_master_key(master_key_path.as_deref())?;

    let bits = cli.rsa_bits.unwrap_or(config.worker.rsa_bits);
    let identity = tokio::task::spawn_blocking(move || WorkerIdentity::generate(bits))
        .await
        .context("joining key generation")??;
    info!(bits, "handshake key generated");

    let service = ImageService::new(
        master,
        SettingsStore::new(expand_tilde(&config.ttl.settings_file)),
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = imaged_ipc::serve(stdin, stdout, &identity, &service) => {
            result.context("worker channel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    info!("imaged-worker stopped");
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
            .init();
    }
}
