use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ImagedError, ImagedResult};

/// Command names understood by the worker
pub mod names {
    pub const CONVERT_TO_TTL: &str = "CONVERT_TO_TTL";
    pub const OPEN_TTL: &str = "OPEN_TTL";
    pub const BATCH_CONVERT: &str = "BATCH_CONVERT";
    pub const GET_CONFIG: &str = "GET_CONFIG";
    pub const SET_CONFIG: &str = "SET_CONFIG";
}

/// A named request with JSON parameters, serialized once per exchange.
///
/// Parameters are kept in a sorted map so the encoded bytes are canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(alias = "Command")]
    command: String,
    #[serde(alias = "Parameters", default, deserialize_with = "null_as_empty")]
    parameters: Map<String, Value>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            command: name.into(),
            parameters: Map::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.command
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn to_bytes(&self) -> ImagedResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ImagedError::Other(anyhow::anyhow!("command serialization: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> ImagedResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ImagedError::ProtocolViolation(format!("malformed command: {e}")))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outcome of one command. `result` is meaningful only when `success` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Convert into a typed result; a failed response becomes `ImagedError::Worker`.
    pub fn into_result(self) -> ImagedResult<Value> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(ImagedError::Worker(
                self.error.unwrap_or_else(|| "unspecified worker error".into()),
            ))
        }
    }
}

/// First frame of every worker reply. `has_payload` announces a second
/// frame carrying raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(flatten)]
    pub response: Response,
    #[serde(default)]
    pub has_payload: bool,
}

impl StreamMetadata {
    pub fn to_bytes(&self) -> ImagedResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ImagedError::Other(anyhow::anyhow!("response serialization: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> ImagedResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ImagedError::ProtocolViolation(format!("malformed response: {e}")))
    }
}

/// A complete worker reply: one frame, or metadata followed by a payload frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Single(Response),
    Streamed { metadata: Response, payload: Vec<u8> },
}

impl Reply {
    pub fn response(&self) -> &Response {
        match self {
            Reply::Single(r) => r,
            Reply::Streamed { metadata, .. } => metadata,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            Reply::Single(r) => r,
            Reply::Streamed { metadata, .. } => metadata,
        }
    }

    /// Header frame as sent on the wire.
    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            response: self.response().clone(),
            has_payload: matches!(self, Reply::Streamed { .. }),
        }
    }
}

impl From<Response> for Reply {
    fn from(r: Response) -> Self {
        Reply::Single(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_accepts_pascal_case_keys() {
        let raw = br#"{"Command":"GET_CONFIG","Parameters":{"x":1}}"#;
        let cmd = Command::from_bytes(raw).unwrap();
        assert_eq!(cmd.name(), names::GET_CONFIG);
        assert_eq!(cmd.param("x"), Some(&json!(1)));
    }

    #[test]
    fn command_null_parameters_become_empty() {
        let cmd = Command::from_bytes(br#"{"command":"GET_CONFIG","parameters":null}"#).unwrap();
        assert!(cmd.parameters().is_empty());
    }

    #[test]
    fn command_encoding_is_canonical() {
        let a = Command::new("X").with("b", 2).with("a", 1);
        let b = Command::new("X").with("a", 1).with("b", 2);
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn metadata_defaults_to_single_frame() {
        let meta = StreamMetadata::from_bytes(br#"{"success":true,"result":"ok","error":null}"#)
            .unwrap();
        assert!(!meta.has_payload);
        assert_eq!(meta.response, Response::ok("ok"));
    }

    #[test]
    fn streamed_reply_announces_payload() {
        let reply = Reply::Streamed {
            metadata: Response::ok(json!({"size": 3})),
            payload: vec![1, 2, 3],
        };
        let wire = reply.metadata().to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(value["has_payload"], json!(true));
        assert_eq!(value["result"]["size"], json!(3));
    }

    #[test]
    fn failed_response_into_result() {
        let err = Response::failure("Unknown command: NOPE")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, ImagedError::Worker(m) if m.contains("NOPE")));
    }
}
