//! Typed front-end API over the supervised channel

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use imaged_core::config::{ImagedConfig, TtlConfig};
use imaged_core::types::names;
use imaged_core::{Command, ImagedError, ImagedResult, Reply};
use imaged_crypto::ttl::{self, unix_now, FIXED_HEADER_LEN};
use imaged_crypto::ExpiryStatus;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;

use crate::launcher::{Launcher, ProcessLauncher};
use crate::supervisor::{Supervisor, SupervisorOptions};

/// Longest edge of a thumbnail when the caller does not choose one
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 1024;

/// Result of converting one file in a batch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchOutcome {
    pub input: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.output.is_some() && self.error.is_none()
    }
}

pub struct ImagedClient<L> {
    supervisor: Supervisor<L>,
    near_expiry: Duration,
    max_lifetime: Duration,
}

impl ImagedClient<ProcessLauncher> {
    pub fn from_config(config: &ImagedConfig) -> Self {
        Self::new(
            Supervisor::new(
                ProcessLauncher::from_config(&config.worker),
                SupervisorOptions::from_config(config),
            ),
            &config.ttl,
        )
    }
}

impl<L: Launcher> ImagedClient<L> {
    pub fn new(supervisor: Supervisor<L>, ttl: &TtlConfig) -> Self {
        Self {
            supervisor,
            near_expiry: ttl.near_expiry_window(),
            max_lifetime: ttl.max_lifetime(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<L> {
        &self.supervisor
    }

    /// Seal `input` into a TTL container next to it (`.ttl` extension).
    pub async fn convert_to_ttl(&self, input: &Path, expiry: i64) -> ImagedResult<PathBuf> {
        self.convert_to_ttl_at(input, expiry, None).await
    }

    pub async fn convert_to_ttl_at(
        &self,
        input: &Path,
        expiry: i64,
        output: Option<&Path>,
    ) -> ImagedResult<PathBuf> {
        self.validate_expiry(expiry)?;
        let mut command = Command::new(names::CONVERT_TO_TTL)
            .with("input_path", path_value(input))
            .with("expiry_ts", expiry);
        if let Some(output) = output {
            command = command.with("output_path", path_value(output));
        }

        match self.call(&command).await? {
            Value::String(path) => Ok(PathBuf::from(path)),
            other => Err(ImagedError::ProtocolViolation(format!(
                "CONVERT_TO_TTL returned {other}"
            ))),
        }
    }

    /// Convert several files in one request. Per-file failures are reported
    /// in the outcomes, not as an error.
    pub async fn batch_convert(
        &self,
        inputs: &[PathBuf],
        expiry: i64,
        output_dir: Option<&Path>,
    ) -> ImagedResult<Vec<BatchOutcome>> {
        self.validate_expiry(expiry)?;
        let paths: Vec<Value> = inputs.iter().map(|p| path_value(p)).collect();
        let mut command = Command::new(names::BATCH_CONVERT)
            .with("input_paths", paths)
            .with("expiry_ts", expiry);
        if let Some(dir) = output_dir {
            command = command.with("output_dir", path_value(dir));
        }

        let result = self.call(&command).await?;
        serde_json::from_value(result)
            .map_err(|e| ImagedError::ProtocolViolation(format!("BATCH_CONVERT result: {e}")))
    }

    /// Decrypt a container and return the image bytes.
    ///
    /// The expiry is checked locally first so an expired container never
    /// reaches the worker.
    pub async fn open_ttl(
        &self,
        path: &Path,
        thumbnail_mode: bool,
        max_size: Option<u32>,
    ) -> ImagedResult<Vec<u8>> {
        let expiry = read_expiry_file(path)
            .await?
            .ok_or_else(|| ImagedError::Format(format!("{} is not a TTL container", path.display())))?;
        if ExpiryStatus::classify(expiry, unix_now()).is_expired() {
            return Err(ImagedError::Expired(expiry));
        }

        let command = Command::new(names::OPEN_TTL)
            .with("input_path", path_value(path))
            .with("thumbnail_mode", thumbnail_mode)
            .with("max_size", max_size.unwrap_or(DEFAULT_THUMBNAIL_SIZE));

        match self.supervisor.exchange(&command).await? {
            Reply::Streamed { metadata, payload } => {
                metadata.into_result()?;
                Ok(payload)
            }
            // Older workers inline the image as a base64 string
            Reply::Single(response) => match response.into_result()? {
                Value::String(encoded) => B64.decode(encoded.trim()).map_err(|e| {
                    ImagedError::ProtocolViolation(format!("OPEN_TTL inline payload: {e}"))
                }),
                other => Err(ImagedError::ProtocolViolation(format!(
                    "OPEN_TTL returned {other} without a payload"
                ))),
            },
        }
    }

    pub async fn open_ttl_thumbnail(&self, path: &Path, max_size: u32) -> ImagedResult<Vec<u8>> {
        self.open_ttl(path, true, Some(max_size)).await
    }

    /// Classify a container's expiry without contacting the worker.
    pub async fn expiry_status(&self, path: &Path) -> ImagedResult<(i64, ExpiryStatus)> {
        let expiry = read_expiry_file(path)
            .await?
            .ok_or_else(|| ImagedError::Format(format!("{} is not a TTL container", path.display())))?;
        Ok((
            expiry,
            ExpiryStatus::classify_within(expiry, unix_now(), self.near_expiry),
        ))
    }

    pub async fn get_configuration(&self) -> ImagedResult<Map<String, Value>> {
        match self.call(&Command::new(names::GET_CONFIG)).await? {
            Value::Object(map) => Ok(map),
            other => Err(ImagedError::ProtocolViolation(format!(
                "GET_CONFIG returned {other}"
            ))),
        }
    }

    /// Replace the worker's settings. Returns the worker's acknowledgement.
    pub async fn set_configuration(&self, config: Map<String, Value>) -> ImagedResult<String> {
        let command = Command::new(names::SET_CONFIG).with("config", Value::Object(config));
        match self.call(&command).await? {
            Value::String(ack) => Ok(ack),
            other => Ok(other.to_string()),
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    async fn call(&self, command: &Command) -> ImagedResult<Value> {
        self.supervisor
            .exchange(command)
            .await?
            .into_response()
            .into_result()
    }

    fn validate_expiry(&self, expiry: i64) -> ImagedResult<()> {
        let now = unix_now();
        if expiry <= now {
            return Err(ImagedError::InvalidRequest(format!(
                "expiry {expiry} is not in the future"
            )));
        }
        let max = i64::try_from(self.max_lifetime.as_secs()).unwrap_or(i64::MAX);
        if expiry - now > max {
            return Err(ImagedError::InvalidRequest(format!(
                "expiry {expiry} exceeds the maximum lifetime of {} days",
                self.max_lifetime.as_secs() / 86_400
            )));
        }
        Ok(())
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

/// Read a container's advisory expiry from its header.
///
/// `Ok(None)` when the file is too short or not a container.
pub async fn read_expiry_file(path: &Path) -> ImagedResult<Option<i64>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(FIXED_HEADER_LEN);
    file.take(FIXED_HEADER_LEN as u64)
        .read_to_end(&mut head)
        .await?;
    Ok(ttl::read_expiry(&head))
}
