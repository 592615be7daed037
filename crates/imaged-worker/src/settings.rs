//! User settings served by GET_CONFIG / SET_CONFIG
//!
//! A flat JSON object. `ntp_server` and `default_ttl_hours` are required;
//! every other key is stored as given.

use std::path::PathBuf;

use imaged_core::{ImagedError, ImagedResult};
use serde_json::{Map, Value};

pub type Settings = Map<String, Value>;

const REQUIRED_FIELDS: [&str; 2] = ["ntp_server", "default_ttl_hours"];

pub fn validate(settings: &Settings) -> Result<(), String> {
    for field in REQUIRED_FIELDS {
        if !settings.contains_key(field) {
            return Err(format!("Missing required configuration field: {field}"));
        }
    }

    match settings.get("ntp_server") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => return Err("ntp_server must be a non-empty string".into()),
    }

    match settings.get("default_ttl_hours").and_then(Value::as_f64) {
        Some(hours) if hours > 0.0 => {}
        _ => return Err("default_ttl_hours must be a positive number".into()),
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current settings; an empty object when nothing has been saved yet.
    pub async fn load(&self) -> ImagedResult<Settings> {
        if !self.path.exists() {
            return Ok(Settings::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ImagedError::Config(format!("reading {}: {e}", self.path.display())))?;
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| ImagedError::Config(format!("parsing {}: {e}", self.path.display())))?;
        validate(&settings)
            .map_err(|e| ImagedError::Config(format!("{}: {e}", self.path.display())))?;
        Ok(settings)
    }

    pub async fn save(&self, settings: &Settings) -> ImagedResult<()> {
        validate(settings).map_err(ImagedError::InvalidRequest)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ImagedError::Other(anyhow::anyhow!("serializing settings: {e}")))?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
