//! RSA-OAEP(SHA-256) wrapping of the session key
//!
//! The worker owns an ephemeral RSA key pair for the lifetime of one process
//! and publishes the public half as SubjectPublicKeyInfo PEM. The front end
//! wraps a freshly generated [`SessionKey`] under it; only the worker can
//! unwrap it.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use crate::aead::SessionKey;

/// Smallest modulus accepted for a handshake key
pub const MIN_RSA_BITS: usize = 1024;

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("RSA key generation failed: {0}")]
    KeyGen(String),

    #[error("failed to parse RSA public key from PEM: {0}")]
    Parse(String),

    #[error("failed to encode RSA public key: {0}")]
    Encode(String),

    #[error("RSA-OAEP encryption failed: {0}")]
    Encrypt(String),

    #[error("RSA-OAEP decryption failed")]
    Decrypt,

    #[error("unwrapped session key has wrong size: {0} bytes")]
    KeySize(usize),
}

/// The worker's handshake key pair.
pub struct WorkerIdentity {
    private: RsaPrivateKey,
}

impl WorkerIdentity {
    pub fn generate(bits: usize) -> Result<Self, WrapError> {
        if bits < MIN_RSA_BITS {
            return Err(WrapError::KeyGen(format!(
                "{bits}-bit modulus is below the {MIN_RSA_BITS}-bit minimum"
            )));
        }
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| WrapError::KeyGen(e.to_string()))?;
        Ok(Self { private })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private)
    }

    /// SubjectPublicKeyInfo PEM (`-----BEGIN PUBLIC KEY-----`).
    pub fn public_key_pem(&self) -> Result<String, WrapError> {
        self.public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| WrapError::Encode(e.to_string()))
    }

    /// Recover the session key sent by the front end.
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, WrapError> {
        let mut plaintext = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| WrapError::Decrypt)?;

        let key = SessionKey::from_slice(&plaintext);
        let len = plaintext.len();
        plaintext.zeroize();
        key.ok_or(WrapError::KeySize(len))
    }
}

impl std::fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerIdentity")
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Parse a public key in SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, WrapError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|spki_err| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| WrapError::Parse(spki_err.to_string()))
        })
}

/// Encrypt the session key under the worker's public key.
pub fn wrap_session_key(public: &RsaPublicKey, key: &SessionKey) -> Result<Vec<u8>, WrapError> {
    public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| WrapError::Encrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    // Key generation dominates test time; share one small key.
    fn identity() -> &'static WorkerIdentity {
        static IDENTITY: OnceLock<WorkerIdentity> = OnceLock::new();
        IDENTITY.get_or_init(|| WorkerIdentity::generate(1024).unwrap())
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&identity().public_key(), &session).unwrap();
        let unwrapped = identity().unwrap_session_key(&wrapped).unwrap();
        assert_eq!(session.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_wrap_through_pem() {
        let pem = identity().public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let public = parse_public_key_pem(&pem).unwrap();
        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&public, &session).unwrap();
        let unwrapped = identity().unwrap_session_key(&wrapped).unwrap();
        assert_eq!(session.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let session = SessionKey::from_bytes([5u8; 32]);
        let a = wrap_session_key(&identity().public_key(), &session).unwrap();
        let b = wrap_session_key(&identity().public_key(), &session).unwrap();
        assert_ne!(a, b, "OAEP must not be deterministic");
    }

    #[test]
    fn test_unwrap_garbage_fails() {
        let result = identity().unwrap_session_key(&[0u8; 128]);
        assert!(matches!(result, Err(WrapError::Decrypt)));
    }

    #[test]
    fn test_unwrap_wrong_size_key() {
        let wrapped = identity()
            .public_key()
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &[1u8; 16])
            .unwrap();
        let result = identity().unwrap_session_key(&wrapped);
        assert!(matches!(result, Err(WrapError::KeySize(16))));
    }

    #[test]
    fn test_generate_rejects_small_modulus() {
        let result = WorkerIdentity::generate(512);
        assert!(matches!(result, Err(WrapError::KeyGen(m)) if m.contains("minimum")));
    }

    #[test]
    fn test_parse_rejects_non_pem() {
        assert!(matches!(
            parse_public_key_pem("not a key"),
            Err(WrapError::Parse(_))
        ));
    }
}
