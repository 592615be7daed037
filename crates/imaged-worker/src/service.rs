//! Command execution inside the worker

use std::io::Write;
use std::path::{Path, PathBuf};

use imaged_core::types::names;
use imaged_core::{Command, ImagedError, ImagedResult, Reply, Response};
use imaged_crypto::ttl::{self, unix_now};
use imaged_crypto::{ExpiryStatus, MasterKey, TtlError};
use imaged_ipc::CommandHandler;
use serde_json::{json, Value};

use crate::settings::SettingsStore;
use crate::thumbnail;

pub const DEFAULT_MAX_SIZE: u32 = 1024;

pub struct ImageService {
    master: MasterKey,
    settings: SettingsStore,
}

impl CommandHandler for ImageService {
    async fn handle(&self, command: Command) -> Reply {
        let result = match command.name() {
            names::CONVERT_TO_TTL => self.convert_to_ttl(&command).await.map(Reply::from),
            names::OPEN_TTL => self.open_ttl(&command).await,
            names::BATCH_CONVERT => self.batch_convert(&command).await.map(Reply::from),
            names::GET_CONFIG => self.get_config().await.map(Reply::from),
            names::SET_CONFIG => self.set_config(&command).await.map(Reply::from),
            other => Err(ImagedError::InvalidRequest(format!("Unknown command: {other}"))),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(command = command.name(), "command failed: {e}");
            Reply::Single(Response::failure(failure_message(&e)))
        })
    }
}

impl ImageService {
    pub fn new(master: MasterKey, settings: SettingsStore) -> Self {
        Self { master, settings }
    }

    async fn convert_to_ttl(&self, command: &Command) -> ImagedResult<Response> {
        let input = required_path(command, "input_path")?;
        let expiry = required_expiry(command)?;
        let output = match command.param("output_path").and_then(Value::as_str) {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_output(&input, None),
        };

        let written = self.convert_file(&input, expiry, &output).await?;
        Ok(Response::ok(written.to_string_lossy().into_owned()))
    }

    async fn batch_convert(&self, command: &Command) -> ImagedResult<Response> {
        let inputs = command
            .param("input_paths")
            .and_then(Value::as_array)
            .ok_or_else(|| ImagedError::InvalidRequest("input_paths must be a list".into()))?;
        let expiry = required_expiry(command)?;
        let output_dir = command
            .param("output_dir")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let mut outcomes = Vec::with_capacity(inputs.len());
        for input in inputs {
            let Some(input) = input.as_str() else {
                outcomes.push(json!({ "input": input, "error": "input path is not a string" }));
                continue;
            };
            let input = PathBuf::from(input);
            let output = default_output(&input, output_dir.as_deref());
            match self.convert_file(&input, expiry, &output).await {
                Ok(written) => outcomes.push(json!({ "input": input, "output": written })),
                Err(e) => outcomes.push(json!({ "input": input, "error": failure_message(&e) })),
            }
        }

        let failed = outcomes.iter().filter(|o| o.get("error").is_some()).count();
        tracing::info!(total = outcomes.len(), failed, "batch conversion finished");
        Ok(Response::ok(Value::Array(outcomes)))
    }

    async fn convert_file(&self, input: &Path, expiry: i64, output: &Path) -> ImagedResult<PathBuf> {
        if !input.is_file() {
            return Err(ImagedError::InvalidRequest(
                "input_path missing or file not found".into(),
            ));
        }
        if expiry <= unix_now() {
            return Err(ImagedError::InvalidRequest(format!(
                "expiry {expiry} is not in the future"
            )));
        }

        let image = tokio::fs::read(input).await?;
        let container = ttl::encode(expiry, &image, &self.master).map_err(ttl_error)?;
        write_atomic(output, &container)?;

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            expiry,
            "TTL container created"
        );
        Ok(output.to_path_buf())
    }

    async fn open_ttl(&self, command: &Command) -> ImagedResult<Reply> {
        let input = required_path(command, "input_path")?;
        let thumbnail_mode = command
            .param("thumbnail_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let max_size = command
            .param("max_size")
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_MAX_SIZE);

        let container = tokio::fs::read(&input).await?;
        // Expired bodies are never decrypted
        let expiry = ttl::read_verified_expiry(&container, &self.master).map_err(ttl_error)?;
        let status = ExpiryStatus::classify(expiry, unix_now());
        if status.is_expired() {
            return Err(ImagedError::Expired(expiry));
        }
        let contents = ttl::decode(&container, &self.master).map_err(ttl_error)?;

        let payload = if thumbnail_mode {
            thumbnail::render(&contents.payload, max_size)?
        } else {
            contents.payload
        };

        tracing::info!(
            input = %input.display(),
            thumbnail = thumbnail_mode,
            bytes = payload.len(),
            %status,
            "TTL container opened"
        );
        Ok(Reply::Streamed {
            metadata: Response::ok(json!({
                "expiry": contents.expiry,
                "status": status.to_string(),
                "size": payload.len(),
                "thumbnail": thumbnail_mode,
            })),
            payload,
        })
    }

    async fn get_config(&self) -> ImagedResult<Response> {
        Ok(Response::ok(Value::Object(self.settings.load().await?)))
    }

    async fn set_config(&self, command: &Command) -> ImagedResult<Response> {
        let config = match command.param("config") {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ => return Err(ImagedError::InvalidRequest("No config data provided".into())),
        };
        self.settings.save(config).await?;
        Ok(Response::ok("Configuration saved"))
    }
}

fn required_path(command: &Command, key: &str) -> ImagedResult<PathBuf> {
    command
        .param(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| ImagedError::InvalidRequest(format!("{key} is required")))
}

fn required_expiry(command: &Command) -> ImagedResult<i64> {
    let value = command
        .param("expiry_ts")
        .ok_or_else(|| ImagedError::InvalidRequest("expiry_ts is required".into()))?;
    // Accept fractional timestamps; the container stores whole seconds
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| ImagedError::InvalidRequest("expiry_ts must be a number".into()))
}

/// `<dir or input dir>/<input stem>.ttl`
fn default_output(input: &Path, dir: Option<&Path>) -> PathBuf {
    let renamed = input.with_extension("ttl");
    match (dir, renamed.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => renamed,
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> ImagedResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ImagedError::Io(e.error))?;
    Ok(())
}

fn ttl_error(e: TtlError) -> ImagedError {
    match e {
        TtlError::Format(msg) => ImagedError::Format(msg),
        TtlError::Auth(what) => ImagedError::AuthFailure(what.into()),
        TtlError::Crypto(msg) => ImagedError::Other(anyhow::anyhow!(msg)),
    }
}

/// Message sent back to the front end. Rejections carry their own text.
fn failure_message(e: &ImagedError) -> String {
    match e {
        ImagedError::InvalidRequest(msg) => msg.clone(),
        other => other.to_string(),
    }
}
