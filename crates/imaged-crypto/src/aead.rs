//! AES-256-GCM sealing for the worker channel
//!
//! Sealed message format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Every `seal` draws a fresh random nonce. With 96-bit random nonces the
//! collision bound stays negligible for the number of messages a single
//! worker session exchanges.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Smallest valid sealed message: nonce + tag around an empty plaintext
pub const MIN_SEALED_LEN: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    #[error("sealed data too short: {0} bytes (minimum {MIN_SEALED_LEN})")]
    TooShort(usize),

    #[error("authentication tag mismatch: wrong key or corrupted data")]
    TagMismatch,

    #[error("encryption failed")]
    Encrypt,
}

/// The 256-bit symmetric key of one worker session. Zeroized on drop.
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build from an unwrapped slice; anything but exactly 32 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt `plaintext` under `key`.
///
/// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| AeadError::Encrypt)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`seal`].
///
/// A failure here concerns one message only; the session stays usable.
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, AeadError> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(AeadError::TooShort(sealed.len()));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AeadError::TagMismatch)
}
