//! imaged-core: shared types for the imaged front-end and worker
//!
//! - `config`: TOML configuration schema shared by both binaries
//! - `error`: the error taxonomy surfaced by the secure channel
//! - `types`: commands, responses, and streamed replies exchanged with the worker

pub mod config;
pub mod error;
pub mod types;

pub use error::{ErrorKind, ImagedError, ImagedResult};
pub use types::{Command, Reply, Response, StreamMetadata};
