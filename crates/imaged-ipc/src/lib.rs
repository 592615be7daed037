//! imaged-ipc: the secure command channel between the front end and the worker
//!
//! Wire protocol (every line is standard base64, newline-terminated):
//! ```text
//! worker → front end   base64(PEM public key)
//! front end → worker   base64(RSA-OAEP-SHA256(public key, session key))
//! worker → front end   base64(seal(session key, "CHANNEL_ESTABLISHED"))
//! then, repeatedly:
//! front end → worker   base64(u32 BE length || seal(session key, command JSON))
//! worker → front end   base64(seal(session key, response JSON))
//!                      [+ base64(seal(session key, payload)) when has_payload]
//! ```
//!
//! The channel is half-duplex and exclusive: one exchange completes before the
//! next begins, so replies are matched to requests by order alone.

pub mod channel;
pub mod client;
pub mod framing;
pub mod handshake;
pub mod launcher;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use channel::SecureChannel;
pub use client::{read_expiry_file, BatchOutcome, ImagedClient};
pub use handshake::{Handshake, HandshakeState, CONFIRMATION_SENTINEL};
pub use launcher::{Launcher, ProcessLauncher, WorkerHandle, WorkerLink};
pub use supervisor::{RetryPolicy, Supervisor, SupervisorOptions, SupervisorState};
pub use worker::{serve, CommandHandler};
