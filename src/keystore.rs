//! Process key material: the master key that wraps tenant DEKs and the
//! optional KEM key pair for the asymmetric wrap scheme.
//!
//! Everything here is loaded once at startup from configuration and held
//! read-only for the process lifetime. Rotation is out of scope; the
//! per-tenant `key_version` column is the extension point for it.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroize;

use crate::config::LedgerConfig;
use crate::envelope::{KemKeypair, WrapScheme};
use crate::LedgerError;

pub const MASTER_KEY_LEN: usize = 32;

pub struct KeyStore {
    master_key: [u8; MASTER_KEY_LEN],
    kem_keypair: Option<KemKeypair>,
}

impl KeyStore {
    /// Resolve key material per configuration. Order for the master key:
    /// inline hex (usually via `LEDGER_MASTER_KEY`), then key file, then
    /// an explicitly flagged development fallback. Anything else fails
    /// with [`LedgerError::KeyConfiguration`] before a single write is
    /// accepted.
    pub fn load(cfg: &LedgerConfig) -> Result<Self> {
        let master_key = load_master_key(cfg)?;
        let kem_keypair = match cfg.keys.wrap_scheme {
            WrapScheme::MasterKey => None,
            WrapScheme::Kem => Some(load_kem_keypair(cfg)?),
        };
        Ok(Self {
            master_key,
            kem_keypair,
        })
    }

    pub fn master_key(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.master_key
    }

    pub fn kem_keypair(&self) -> Option<&KemKeypair> {
        self.kem_keypair.as_ref()
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("kem_keypair", &self.kem_keypair.is_some())
            .finish_non_exhaustive()
    }
}

fn load_master_key(cfg: &LedgerConfig) -> Result<[u8; MASTER_KEY_LEN]> {
    if let Some(hex_key) = cfg.keys.master_key_hex.as_deref() {
        return master_key_from_hex(hex_key);
    }

    if let Some(path) = cfg.keys.master_key_path.as_deref() {
        let contents = read_key_file(path)?;
        return master_key_from_hex(&contents);
    }

    if cfg.keys.allow_dev_master_key {
        // Operators must be able to see that writes are not protected by
        // provisioned key material.
        log::warn!(
            "no master key configured; generating an ephemeral development key \
             (records will be unreadable after restart)"
        );
        let mut key = [0u8; MASTER_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        return Ok(key);
    }

    Err(LedgerError::KeyConfiguration(
        "master key is required: set LEDGER_MASTER_KEY or keys.master_key_path".to_string(),
    )
    .into())
}

fn master_key_from_hex(hex_key: &str) -> Result<[u8; MASTER_KEY_LEN]> {
    let trimmed = hex_key.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::KeyConfiguration("master key is empty".to_string()).into());
    }
    let bytes = hex::decode(trimmed).map_err(|_| {
        LedgerError::KeyConfiguration("master key is not valid hex".to_string())
    })?;
    if bytes.len() != MASTER_KEY_LEN {
        return Err(LedgerError::KeyConfiguration(format!(
            "master key must be {} bytes, got {}",
            MASTER_KEY_LEN,
            bytes.len()
        ))
        .into());
    }
    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn load_kem_keypair(cfg: &LedgerConfig) -> Result<KemKeypair> {
    let public_path = cfg.keys.kem_public_path.as_deref().ok_or_else(|| {
        LedgerError::KeyConfiguration(
            "kem wrap scheme requires keys.kem_public_path".to_string(),
        )
    })?;
    let secret_path = cfg.keys.kem_secret_path.as_deref().ok_or_else(|| {
        LedgerError::KeyConfiguration(
            "kem wrap scheme requires keys.kem_secret_path".to_string(),
        )
    })?;

    let public = read_key_bytes(public_path)?;
    let secret = read_key_bytes(secret_path)?;
    KemKeypair::from_bytes(&public, &secret)
}

fn read_key_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).map_err(|e| {
        LedgerError::KeyLoad(format!("failed to read key file {}: {}", path.display(), e))
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(
            LedgerError::KeyLoad(format!("key file {} is empty", path.display())).into(),
        );
    }
    Ok(trimmed.to_string())
}

fn read_key_bytes(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).map_err(|e| {
        LedgerError::KeyLoad(format!("failed to read key file {}: {}", path.display(), e))
    })?;
    if bytes.is_empty() {
        return Err(
            LedgerError::KeyLoad(format!("key file {} is empty", path.display())).into(),
        );
    }
    Ok(bytes)
}

/// Write a generated master key to disk, hex encoded, refusing to clobber
/// an existing file. Used by provisioning tooling, not by `KeyStore::load`.
pub fn write_master_key_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow!("failed to create key directory {}: {}", parent.display(), e)
            })?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| {
        anyhow!("failed to create key file {}: {}", path.display(), e)
    })?;

    let mut key = [0u8; MASTER_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    let encoded = hex::encode(key);
    key.zeroize();

    file.write_all(encoded.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| anyhow!("failed to write key file {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;

    #[test]
    fn rejects_missing_key_outside_dev_mode() {
        let mut cfg = LedgerConfig::default();
        cfg.keys.allow_dev_master_key = false;
        let err = KeyStore::load(&cfg).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::KeyConfiguration(_))
        ));
    }

    #[test]
    fn rejects_short_and_malformed_keys() {
        for bad in ["", "abcd", "zz".repeat(32).as_str()] {
            let mut cfg = LedgerConfig::default();
            cfg.keys.master_key_hex = Some(bad.to_string());
            assert!(KeyStore::load(&cfg).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn loads_key_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("master.key");
        write_master_key_file(&path)?;

        let mut cfg = LedgerConfig::default();
        cfg.keys.allow_dev_master_key = false;
        cfg.keys.master_key_path = Some(path.clone());
        let store = KeyStore::load(&cfg)?;
        assert_eq!(store.master_key().len(), MASTER_KEY_LEN);

        // Refuses to clobber existing key material.
        assert!(write_master_key_file(&path).is_err());
        Ok(())
    }
}
