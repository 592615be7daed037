//! TTL container codec
//!
//! On-disk layout (fixed offsets, 78-byte header):
//! ```text
//! offset  len  field
//!      0    6  magic         "IMAGED"
//!      6   16  salt          per-container HKDF salt
//!     22   12  header_nonce
//!     34    8  header        expiry, big-endian Unix seconds (plaintext)
//!     42    8  header_tag    truncated GMAC over magic||salt||header
//!     50   12  body_nonce
//!     62   16  body_tag      GCM tag over body, AAD = bytes[0..50]
//!     78    N  body          AES-256-GCM ciphertext of the image
//! ```
//!
//! The expiry is readable without any key so that galleries can classify
//! containers cheaply, but it is authenticated: `decode` rejects a container
//! whose expiry was edited before a single payload byte is released.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zeroize::Zeroize;

use crate::keys::{derive_subkey, MasterKey};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 6] = b"IMAGED";

pub const SALT_SIZE: usize = 16;
pub const HEADER_TAG_SIZE: usize = 8;

const MAGIC_OFFSET: usize = 0;
const SALT_OFFSET: usize = MAGIC_OFFSET + MAGIC.len();
const HEADER_NONCE_OFFSET: usize = SALT_OFFSET + SALT_SIZE;
const HEADER_OFFSET: usize = HEADER_NONCE_OFFSET + NONCE_SIZE;
const HEADER_TAG_OFFSET: usize = HEADER_OFFSET + 8;
const BODY_NONCE_OFFSET: usize = HEADER_TAG_OFFSET + HEADER_TAG_SIZE;
const BODY_TAG_OFFSET: usize = BODY_NONCE_OFFSET + NONCE_SIZE;

/// Length of the fixed header; the body starts here.
pub const FIXED_HEADER_LEN: usize = BODY_TAG_OFFSET + TAG_SIZE;

const HEADER_INFO: &[u8] = b"imaged-ttl-header";
const BODY_INFO: &[u8] = b"imaged-ttl-body";

/// Default width of the near-expiry window
pub const NEAR_EXPIRY_WINDOW: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum TtlError {
    #[error("not a TTL container: {0}")]
    Format(String),

    #[error("TTL container integrity check failed: {0}")]
    Auth(&'static str),

    #[error("TTL key derivation failed: {0}")]
    Crypto(String),
}

/// The verified contents of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlContents {
    pub expiry: i64,
    pub payload: Vec<u8>,
}

/// Expiry classification relative to a reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Expired,
    NearExpiry,
    Active,
}

impl ExpiryStatus {
    /// Classify with the default 24h near-expiry window.
    pub fn classify(expiry: i64, now: i64) -> Self {
        Self::classify_within(expiry, now, NEAR_EXPIRY_WINDOW)
    }

    pub fn classify_within(expiry: i64, now: i64, window: Duration) -> Self {
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        if expiry < now {
            ExpiryStatus::Expired
        } else if expiry <= now.saturating_add(window) {
            ExpiryStatus::NearExpiry
        } else {
            ExpiryStatus::Active
        }
    }

    pub fn is_expired(self) -> bool {
        self == ExpiryStatus::Expired
    }
}

impl std::fmt::Display for ExpiryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExpiryStatus::Expired => "expired",
            ExpiryStatus::NearExpiry => "near-expiry",
            ExpiryStatus::Active => "active",
        })
    }
}

/// Current time as Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-container subkeys. Zeroized on drop.
struct ContainerKeys {
    header: [u8; KEY_SIZE],
    body: [u8; KEY_SIZE],
}

impl ContainerKeys {
    fn derive(master: &MasterKey, salt: &[u8]) -> Result<Self, TtlError> {
        let header =
            derive_subkey(master, salt, HEADER_INFO).map_err(|e| TtlError::Crypto(e.to_string()))?;
        let body =
            derive_subkey(master, salt, BODY_INFO).map_err(|e| TtlError::Crypto(e.to_string()))?;
        Ok(Self { header, body })
    }
}

impl Drop for ContainerKeys {
    fn drop(&mut self) {
        self.header.zeroize();
        self.body.zeroize();
    }
}

/// Seal `plaintext` into a new container expiring at `expiry` (Unix seconds).
pub fn encode(expiry: i64, plaintext: &[u8], master: &MasterKey) -> Result<Vec<u8>, TtlError> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_SIZE];
    let mut header_nonce = [0u8; NONCE_SIZE];
    let mut body_nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut header_nonce);
    rng.fill_bytes(&mut body_nonce);

    let keys = ContainerKeys::derive(master, &salt)?;

    let mut out = vec![0u8; FIXED_HEADER_LEN + plaintext.len()];
    out[MAGIC_OFFSET..SALT_OFFSET].copy_from_slice(MAGIC);
    out[SALT_OFFSET..HEADER_NONCE_OFFSET].copy_from_slice(&salt);
    out[HEADER_NONCE_OFFSET..HEADER_OFFSET].copy_from_slice(&header_nonce);
    out[HEADER_OFFSET..HEADER_TAG_OFFSET].copy_from_slice(&expiry.to_be_bytes());

    let header_tag = header_mac(&keys.header, &header_nonce, &out[..HEADER_TAG_OFFSET])?;
    out[HEADER_TAG_OFFSET..BODY_NONCE_OFFSET].copy_from_slice(&header_tag);
    out[BODY_NONCE_OFFSET..BODY_TAG_OFFSET].copy_from_slice(&body_nonce);

    let (head, body) = out.split_at_mut(FIXED_HEADER_LEN);
    body.copy_from_slice(plaintext);
    let cipher = Aes256Gcm::new((&keys.body).into());
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&body_nonce),
            &head[..BODY_NONCE_OFFSET],
            body,
        )
        .map_err(|_| TtlError::Crypto("body encryption failed".into()))?;
    head[BODY_TAG_OFFSET..FIXED_HEADER_LEN].copy_from_slice(&tag);

    Ok(out)
}

/// Read the expiry without any key material.
///
/// Returns `None` for buffers shorter than the fixed header or with a foreign
/// magic. The value is not authenticated here; `decode` verifies it.
pub fn read_expiry(container: &[u8]) -> Option<i64> {
    if container.len() < FIXED_HEADER_LEN || &container[..SALT_OFFSET] != MAGIC {
        return None;
    }
    let mut field = [0u8; 8];
    field.copy_from_slice(&container[HEADER_OFFSET..HEADER_TAG_OFFSET]);
    Some(i64::from_be_bytes(field))
}

/// Read the expiry and verify its header tag.
pub fn read_verified_expiry(container: &[u8], master: &MasterKey) -> Result<i64, TtlError> {
    check_format(container)?;
    let keys = ContainerKeys::derive(master, &container[SALT_OFFSET..HEADER_NONCE_OFFSET])?;
    verify_header(container, &keys)
}

/// Verify and decrypt a container. Any tag mismatch is a hard failure.
pub fn decode(container: &[u8], master: &MasterKey) -> Result<TtlContents, TtlError> {
    check_format(container)?;
    let keys = ContainerKeys::derive(master, &container[SALT_OFFSET..HEADER_NONCE_OFFSET])?;
    let expiry = verify_header(container, &keys)?;

    let (head, body) = container.split_at(FIXED_HEADER_LEN);
    let mut payload = body.to_vec();
    let cipher = Aes256Gcm::new((&keys.body).into());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&head[BODY_NONCE_OFFSET..BODY_TAG_OFFSET]),
            &head[..BODY_NONCE_OFFSET],
            &mut payload,
            Tag::from_slice(&head[BODY_TAG_OFFSET..FIXED_HEADER_LEN]),
        )
        .map_err(|_| {
            payload.zeroize();
            TtlError::Auth("body tag mismatch")
        })?;

    Ok(TtlContents { expiry, payload })
}

fn check_format(container: &[u8]) -> Result<(), TtlError> {
    if container.len() < FIXED_HEADER_LEN {
        return Err(TtlError::Format(format!(
            "truncated: {} bytes (minimum {FIXED_HEADER_LEN})",
            container.len()
        )));
    }
    if &container[..SALT_OFFSET] != MAGIC {
        return Err(TtlError::Format("magic mismatch".into()));
    }
    Ok(())
}

fn verify_header(container: &[u8], keys: &ContainerKeys) -> Result<i64, TtlError> {
    let expected = header_mac(
        &keys.header,
        &container[HEADER_NONCE_OFFSET..HEADER_OFFSET],
        &container[..HEADER_TAG_OFFSET],
    )?;
    if !constant_time_eq(&expected, &container[HEADER_TAG_OFFSET..BODY_NONCE_OFFSET]) {
        return Err(TtlError::Auth("header tag mismatch"));
    }
    // check_format guaranteed the fixed header is present
    read_expiry(container).ok_or_else(|| TtlError::Format("unreadable header".into()))
}

/// GMAC over `aad`, truncated to the header tag width.
fn header_mac(
    key: &[u8; KEY_SIZE],
    nonce: &[u8],
    aad: &[u8],
) -> Result<[u8; HEADER_TAG_SIZE], TtlError> {
    let cipher = Aes256Gcm::new(key.into());
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut [])
        .map_err(|_| TtlError::Crypto("header authentication failed".into()))?;
    let mut out = [0u8; HEADER_TAG_SIZE];
    out.copy_from_slice(&tag[..HEADER_TAG_SIZE]);
    Ok(out)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
