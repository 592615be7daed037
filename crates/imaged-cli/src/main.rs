//! imaged: ImAged command-line front end
//!
//! Commands:
//!   convert <image>            - seal an image into a self-expiring .ttl container
//!   batch <glob>               - convert every matching image in one request
//!   open <container> -o <out>  - decrypt a container (or a thumbnail of it)
//!   expiry <container>...      - show expiry status without starting the worker
//!   config show|get|set        - local TOML config / worker-side settings

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imaged_core::config::{expand_tilde, ImagedConfig};
use imaged_crypto::ttl::unix_now;
use imaged_crypto::ExpiryStatus;
use imaged_ipc::{ImagedClient, ProcessLauncher};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "imaged",
    version,
    about = "ImAged self-expiring image client",
    long_about = "imaged: convert images into time-limited encrypted containers and view them until they expire"
)]
struct Cli {
    /// Path to imaged config file
    #[arg(
        long,
        short = 'c',
        env = "IMAGED_CONFIG",
        default_value = "~/.config/imaged/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error) [default: logging.level, else warn]
    #[arg(long, env = "IMAGED_LOG")]
    log: Option<String>,

    /// Log format [default: logging.format, else text]
    #[arg(long, env = "IMAGED_LOG_FORMAT", value_parser = ["json", "text"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct ExpiryArgs {
    /// Lifetime in hours from now (default: worker setting default_ttl_hours, else 24)
    #[arg(long, conflicts_with = "at")]
    hours: Option<f64>,

    /// Absolute expiry as Unix seconds
    #[arg(long)]
    at: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert an image into a TTL container
    Convert {
        /// Image file to convert
        input: PathBuf,
        #[command(flatten)]
        expiry: ExpiryArgs,
        /// Output path (default: input with .ttl extension)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Convert every file matching a glob pattern
    Batch {
        /// Glob pattern, e.g. "photos/*.jpg"
        pattern: String,
        #[command(flatten)]
        expiry: ExpiryArgs,
        /// Directory for the containers (default: next to each input)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Decrypt a TTL container
    Open {
        /// Container to open
        input: PathBuf,
        /// Where to write the decrypted image
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Render a PNG thumbnail instead of the full image
        #[arg(long)]
        thumbnail: bool,
        /// Longest thumbnail edge in pixels
        #[arg(long, default_value_t = 1024)]
        max_size: u32,
    },

    /// Show expiry status of containers (no worker needed)
    Expiry {
        /// Containers to inspect
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active front-end configuration (merged defaults + config file)
    Show,
    /// Print the worker's user settings
    Get,
    /// Update worker settings: key=value (values parsed as JSON when possible)
    Set {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let config_found = config_path.exists();
    let config = ImagedConfig::load(&config_path).await?;
    init_logging(
        config.logging.level_or(cli.log.as_deref(), "warn"),
        config.logging.json_output(cli.log_format.as_deref()),
    );
    if !config_found {
        tracing::warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    if let Commands::Config { action: ConfigAction::Show } = &cli.command {
        return cmd_config_show(&config, &config_path);
    }
    if let Commands::Expiry { paths } = &cli.command {
        return cmd_expiry(&config, paths).await;
    }

    let client = ImagedClient::from_config(&config);
    let result = match cli.command {
        Commands::Convert { input, expiry, output } => {
            cmd_convert(&client, &input, &expiry, output.as_deref()).await
        }
        Commands::Batch { pattern, expiry, output_dir } => {
            cmd_batch(&client, &pattern, &expiry, output_dir.as_deref()).await
        }
        Commands::Open { input, output, thumbnail, max_size } => {
            cmd_open(&client, &input, &output, thumbnail, max_size).await
        }
        Commands::Config { action: ConfigAction::Get } => cmd_config_get(&client).await,
        Commands::Config { action: ConfigAction::Set { pairs } } => {
            cmd_config_set(&client, &pairs).await
        }
        Commands::Config { action: ConfigAction::Show } | Commands::Expiry { .. } => Ok(()),
    };

    client.shutdown().await;
    result
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
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// ── Expiry resolution ─────────────────────────────────────────────────────────

const FALLBACK_TTL_HOURS: f64 = 24.0;

async fn resolve_expiry(client: &ImagedClient<ProcessLauncher>, args: &ExpiryArgs) -> Result<i64> {
    if let Some(at) = args.at {
        return Ok(at);
    }
    let hours = match args.hours {
        Some(h) => h,
        None => client
            .get_configuration()
            .await
            .ok()
            .and_then(|s| s.get("default_ttl_hours").and_then(Value::as_f64))
            .unwrap_or(FALLBACK_TTL_HOURS),
    };
    expiry_after_hours(unix_now(), hours)
}

fn expiry_after_hours(now: i64, hours: f64) -> Result<i64> {
    if hours.is_nan() || hours <= 0.0 {
        anyhow::bail!("--hours must be positive (got {hours})");
    }
    let seconds = (hours * 3600.0).round();
    // `as` saturates, so anything this large cannot be a sane lifetime
    if !seconds.is_finite() || seconds >= i64::MAX as f64 {
        anyhow::bail!("--hours is too large (got {hours})");
    }
    now.checked_add(seconds as i64)
        .with_context(|| format!("--hours is too large (got {hours})"))
}

// ── `imaged convert` ──────────────────────────────────────────────────────────

async fn cmd_convert(
    client: &ImagedClient<ProcessLauncher>,
    input: &Path,
    expiry: &ExpiryArgs,
    output: Option<&Path>,
) -> Result<()> {
    let expiry = resolve_expiry(client, expiry).await?;
    let spinner = make_spinner("convert");
    spinner.set_message(input.display().to_string());

    let written = client
        .convert_to_ttl_at(input, expiry, output)
        .await
        .with_context(|| format!("converting {}", input.display()));
    spinner.finish_and_clear();
    let written = written?;

    println!("Converted: {} → {}", input.display(), written.display());
    println!("  expires: {} ({})", expiry, fmt_remaining(expiry - unix_now()));
    Ok(())
}

// ── `imaged batch` ────────────────────────────────────────────────────────────

async fn cmd_batch(
    client: &ImagedClient<ProcessLauncher>,
    pattern: &str,
    expiry: &ExpiryArgs,
    output_dir: Option<&Path>,
) -> Result<()> {
    let inputs: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("invalid glob pattern: {pattern}"))?
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("skipping unreadable path: {e}");
                None
            }
        })
        .collect();
    if inputs.is_empty() {
        anyhow::bail!("no files match {pattern}");
    }

    let expiry = resolve_expiry(client, expiry).await?;
    let spinner = make_spinner("batch");
    spinner.set_message(format!("{} files", inputs.len()));
    let outcomes = client.batch_convert(&inputs, expiry, output_dir).await;
    spinner.finish_and_clear();
    let outcomes = outcomes.context("batch conversion")?;

    let mut failed = 0;
    for outcome in &outcomes {
        match (&outcome.output, &outcome.error) {
            (Some(out), None) => println!("  ok      {} → {}", outcome.input.display(), out.display()),
            (_, err) => {
                failed += 1;
                println!(
                    "  failed  {}: {}",
                    outcome.input.display(),
                    err.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    println!();
    println!("Batch complete:");
    println!("  converted: {} files", outcomes.len() - failed);
    println!("  failed:    {} files", failed);

    if failed > 0 {
        anyhow::bail!("{failed} of {} conversions failed", outcomes.len());
    }
    Ok(())
}

// ── `imaged open` ─────────────────────────────────────────────────────────────

async fn cmd_open(
    client: &ImagedClient<ProcessLauncher>,
    input: &Path,
    output: &Path,
    thumbnail: bool,
    max_size: u32,
) -> Result<()> {
    let image = client
        .open_ttl(input, thumbnail, Some(max_size))
        .await
        .with_context(|| format!("opening {}", input.display()))?;

    tokio::fs::write(output, &image)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Opened: {} → {}", input.display(), output.display());
    println!("  bytes: {}", fmt_bytes(image.len() as u64));
    Ok(())
}

// ── `imaged expiry` ───────────────────────────────────────────────────────────

async fn cmd_expiry(config: &ImagedConfig, paths: &[PathBuf]) -> Result<()> {
    let now = unix_now();
    for path in paths {
        match imaged_ipc::read_expiry_file(path).await {
            Ok(Some(expiry)) => {
                let status =
                    ExpiryStatus::classify_within(expiry, now, config.ttl.near_expiry_window());
                let when = if status.is_expired() {
                    format!("{} ago", fmt_remaining(now - expiry))
                } else {
                    format!("in {}", fmt_remaining(expiry - now))
                };
                println!("{}: {status} (expires {expiry}, {when})", path.display());
            }
            Ok(None) => println!("{}: not a TTL container", path.display()),
            Err(e) => println!("{}: {e}", path.display()),
        }
    }
    Ok(())
}

// ── `imaged config` ───────────────────────────────────────────────────────────

fn cmd_config_show(config: &ImagedConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

async fn cmd_config_get(client: &ImagedClient<ProcessLauncher>) -> Result<()> {
    let settings = client.get_configuration().await.context("reading worker settings")?;
    if settings.is_empty() {
        println!("# No settings saved");
        return Ok(());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(settings)).context("rendering settings")?
    );
    Ok(())
}

async fn cmd_config_set(client: &ImagedClient<ProcessLauncher>, pairs: &[String]) -> Result<()> {
    let mut settings = client.get_configuration().await.context("reading worker settings")?;
    for (key, value) in parse_pairs(pairs)? {
        settings.insert(key, value);
    }
    let ack = client
        .set_configuration(settings)
        .await
        .context("saving worker settings")?;
    println!("{ack}");
    Ok(())
}

/// `key=value` with `value` parsed as JSON, falling back to a plain string.
fn parse_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got {pair:?}"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn fmt_remaining(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s >= 86_400 => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}
