use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ImagedError, ImagedResult};

/// Top-level configuration (loaded from imaged.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagedConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub ttl: TtlConfig,
    pub logging: LoggingConfig,
}

impl ImagedConfig {
    pub fn from_toml(content: &str) -> ImagedResult<Self> {
        toml::from_str(content).map_err(|e| ImagedError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> ImagedResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ImagedError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| ImagedError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// How the front end launches and talks to the worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable (default: imaged-worker, resolved via PATH)
    pub program: PathBuf,
    /// Extra arguments passed to the worker
    pub args: Vec<String>,
    /// Deadline for each handshake line in seconds (default: 10)
    pub handshake_timeout_secs: u64,
    /// Deadline for each reply line in seconds (default: 10)
    pub command_timeout_secs: u64,
    /// RSA modulus size for the worker's handshake key (default: 2048)
    pub rsa_bits: usize,
}

impl WorkerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Respawn policy for the process supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Spawn + handshake attempts per `ensure_ready` call (default: 3)
    pub max_attempts: u32,
    /// Initial backoff between attempts in milliseconds (default: 250)
    pub backoff_ms: u64,
    /// Backoff cap in milliseconds (default: 4000)
    pub max_backoff_ms: u64,
}

/// TTL container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// 32-byte master key used to derive per-container keys (worker only)
    pub master_key_file: Option<PathBuf>,
    /// JSON settings served by GET_CONFIG / SET_CONFIG (worker only)
    pub settings_file: PathBuf,
    /// Window before expiry in which a container counts as near expiry
    pub near_expiry_hours: u64,
    /// Maximum lifetime accepted at conversion time
    pub max_lifetime_days: u64,
}

impl TtlConfig {
    pub fn near_expiry_window(&self) -> Duration {
        Duration::from_secs(self.near_expiry_hours * 3600)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_days * 86_400)
    }
}

/// Logging defaults for both binaries. `--log` / `--log-format` (and their
/// environment variables) take precedence; unset fields fall back to each
/// binary's own default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "debug" or "imaged_ipc=trace"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// "json" or "text"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl LoggingConfig {
    pub fn level_or<'a>(&'a self, flag: Option<&'a str>, fallback: &'a str) -> &'a str {
        flag.or(self.level.as_deref()).unwrap_or(fallback)
    }

    pub fn json_output(&self, flag: Option<&str>) -> bool {
        flag.or(self.format.as_deref())
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("imaged-worker"),
            args: Vec::new(),
            handshake_timeout_secs: 10,
            command_timeout_secs: 10,
            rsa_bits: 2048,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
            max_backoff_ms: 4000,
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            master_key_file: None,
            settings_file: PathBuf::from("~/.config/imaged/settings.json"),
            near_expiry_hours: 24,
            max_lifetime_days: 5 * 365,
        }
    }
}

/// Expand a leading `~/` against $HOME.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[worker]
program = "/opt/imaged/bin/imaged-worker"
args = ["--log", "debug"]
handshake_timeout_secs = 5
command_timeout_secs = 30
rsa_bits = 3072

[retry]
max_attempts = 5
backoff_ms = 100
max_backoff_ms = 1000

[ttl]
master_key_file = "/etc/imaged/master.key"
settings_file = "/var/lib/imaged/settings.json"
near_expiry_hours = 48
max_lifetime_days = 30

[logging]
level = "debug"
format = "json"
"#;
        let config = ImagedConfig::from_toml(toml_str).unwrap();

        assert_eq!(
            config.worker.program,
            PathBuf::from("/opt/imaged/bin/imaged-worker")
        );
        assert_eq!(config.worker.args, vec!["--log", "debug"]);
        assert_eq!(config.worker.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.worker.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.rsa_bits, 3072);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.ttl.master_key_file,
            Some(PathBuf::from("/etc/imaged/master.key"))
        );
        assert_eq!(config.ttl.near_expiry_window(), Duration::from_secs(48 * 3600));
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_parse_defaults() {
        let config = ImagedConfig::from_toml("").unwrap();

        assert_eq!(config.worker.program, PathBuf::from("imaged-worker"));
        assert_eq!(config.worker.handshake_timeout_secs, 10);
        assert_eq!(config.worker.command_timeout_secs, 10);
        assert_eq!(config.worker.rsa_bits, 2048);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.ttl.near_expiry_hours, 24);
        assert_eq!(config.ttl.max_lifetime_days, 5 * 365);
        assert!(config.ttl.master_key_file.is_none());
        assert!(config.logging.level.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[retry]
max_attempts = 1
"#;
        let config = ImagedConfig::from_toml(toml_str).unwrap();

        // Overridden
        assert_eq!(config.retry.max_attempts, 1);
        // Defaults
        assert_eq!(config.retry.backoff_ms, 250);
        assert_eq!(config.worker.command_timeout_secs, 10);
    }

    #[test]
    fn test_logging_flags_override_file() {
        let config = ImagedConfig::from_toml("[logging]\nlevel = \"debug\"\nformat = \"json\"").unwrap();
        assert_eq!(config.logging.level_or(None, "warn"), "debug");
        assert_eq!(config.logging.level_or(Some("trace"), "warn"), "trace");
        assert!(config.logging.json_output(None));
        assert!(!config.logging.json_output(Some("text")));

        let unset = LoggingConfig::default();
        assert_eq!(unset.level_or(None, "warn"), "warn");
        assert!(!unset.json_output(None));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ImagedConfig::from_toml("[worker]\nrsa_bits = \"many\"").unwrap_err();
        assert!(matches!(err, ImagedError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ImagedConfig::load(&tmp.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config.worker.rsa_bits, 2048);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ImagedConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = ImagedConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.worker.program, parsed.worker.program);
        assert_eq!(config.ttl.settings_file, parsed.ttl.settings_file);
    }
}
