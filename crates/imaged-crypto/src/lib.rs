//! imaged-crypto: cryptographic building blocks for the imaged worker channel
//!
//! Session transport (`aead`):
//! ```text
//! sealed = [12-byte random nonce][ciphertext][16-byte GCM tag]   (AES-256-GCM)
//! ```
//!
//! Session bootstrap (`wrap`): the worker publishes an RSA public key, the
//! front end wraps a fresh 256-bit session key with RSA-OAEP(SHA-256).
//!
//! TTL containers (`ttl`):
//! ```text
//! Master Key (256-bit, from master.key)
//!   └── per-container salt (16 bytes, random)
//!         ├── header subkey  HKDF-SHA256(info="imaged-ttl-header")  → GMAC over expiry
//!         └── body subkey    HKDF-SHA256(info="imaged-ttl-body")    → AES-256-GCM over image
//! ```

pub mod aead;
pub mod keys;
pub mod ttl;
pub mod wrap;

pub use aead::{open, seal, AeadError, SessionKey};
pub use keys::{derive_subkey, load_master_key, MasterKey};
pub use ttl::{ExpiryStatus, TtlContents, TtlError};
pub use wrap::{parse_public_key_pem, wrap_session_key, WorkerIdentity, WrapError};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
