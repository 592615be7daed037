//! Master key loading and per-container subkey derivation

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::path::Path;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// The worker's long-lived 256-bit container master key. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Load the master key from `path`.
///
/// Only the first 32 bytes are used. With no path, or a path that does not
/// exist, an ephemeral key is generated; containers sealed under it cannot
/// be opened after the worker exits.
pub fn load_master_key(path: Option<&Path>) -> anyhow::Result<MasterKey> {
    let Some(path) = path.filter(|p| p.exists()) else {
        tracing::warn!("master key file not found; generated ephemeral key");
        return Ok(MasterKey::generate());
    };

    let mut raw = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("reading master key {}: {e}", path.display()))?;
    if raw.len() < KEY_SIZE {
        let len = raw.len();
        raw.zeroize();
        anyhow::bail!(
            "master key {} must be at least {KEY_SIZE} bytes (got {len})",
            path.display()
        );
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&raw[..KEY_SIZE]);
    raw.zeroize();
    tracing::info!(path = %path.display(), "loaded master key");
    Ok(MasterKey::from_bytes(bytes))
}

/// HKDF-SHA256(salt, master) expanded with a domain-specific info string.
pub fn derive_subkey(
    master: &MasterKey,
    salt: &[u8],
    info: &[u8],
) -> anyhow::Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}
