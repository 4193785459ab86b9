use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::envelope::WrapScheme;
use crate::ingest::DEFAULT_COOLDOWN_SECS;

const DEFAULT_DB_PATH: &str = "ledger.db";

#[derive(Debug, Deserialize, Default)]
struct LedgerConfigFile {
    db_path: Option<String>,
    cooldown_secs: Option<u64>,
    persistence_enabled: Option<bool>,
    keys: Option<KeyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct KeyConfigFile {
    master_key_path: Option<PathBuf>,
    allow_dev_master_key: Option<bool>,
    wrap_scheme: Option<String>,
    kem_public_path: Option<PathBuf>,
    kem_secret_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub db_path: String,
    pub cooldown_secs: u64,
    pub persistence_enabled: bool,
    pub keys: KeySettings,
}

#[derive(Debug, Clone)]
pub struct KeySettings {
    /// Inline hex master key. Set via `LEDGER_MASTER_KEY`; never read
    /// from the config file so the key stays out of checked-in config.
    pub master_key_hex: Option<String>,
    pub master_key_path: Option<PathBuf>,
    pub allow_dev_master_key: bool,
    pub wrap_scheme: WrapScheme,
    pub kem_public_path: Option<PathBuf>,
    pub kem_secret_path: Option<PathBuf>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            master_key_hex: None,
            master_key_path: None,
            allow_dev_master_key: false,
            wrap_scheme: WrapScheme::MasterKey,
            kem_public_path: None,
            kem_secret_path: None,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            persistence_enabled: true,
            keys: KeySettings::default(),
        }
    }
}

impl LedgerConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LEDGER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LedgerConfigFile) -> Result<Self> {
        let keys = file.keys.unwrap_or_default();
        let wrap_scheme = match keys.wrap_scheme.as_deref() {
            Some(raw) => raw.parse()?,
            None => WrapScheme::MasterKey,
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            cooldown_secs: file.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            persistence_enabled: file.persistence_enabled.unwrap_or(true),
            keys: KeySettings {
                master_key_hex: None,
                master_key_path: keys.master_key_path,
                allow_dev_master_key: keys.allow_dev_master_key.unwrap_or(false),
                wrap_scheme,
                kem_public_path: keys.kem_public_path,
                kem_secret_path: keys.kem_secret_path,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("LEDGER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(key) = std::env::var("LEDGER_MASTER_KEY") {
            if !key.trim().is_empty() {
                self.keys.master_key_hex = Some(key);
            }
        }
        if let Ok(path) = std::env::var("LEDGER_MASTER_KEY_PATH") {
            if !path.trim().is_empty() {
                self.keys.master_key_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(cooldown) = std::env::var("LEDGER_COOLDOWN_SECS") {
            self.cooldown_secs = cooldown.parse().map_err(|_| {
                anyhow!("LEDGER_COOLDOWN_SECS must be an integer number of seconds")
            })?;
        }
        if let Ok(enabled) = std::env::var("LEDGER_PERSISTENCE_ENABLED") {
            self.persistence_enabled = match enabled.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(anyhow!(
                        "LEDGER_PERSISTENCE_ENABLED must be a boolean, got {:?}",
                        other
                    ))
                }
            };
        }
        if let Ok(scheme) = std::env::var("LEDGER_WRAP_SCHEME") {
            if !scheme.trim().is_empty() {
                self.keys.wrap_scheme = scheme.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.cooldown_secs == 0 {
            return Err(anyhow!("cooldown_secs must be greater than zero"));
        }
        if self.keys.wrap_scheme == WrapScheme::Kem
            && (self.keys.kem_public_path.is_none() || self.keys.kem_secret_path.is_none())
        {
            return Err(anyhow!(
                "kem wrap scheme requires keys.kem_public_path and keys.kem_secret_path"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<LedgerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let cfg = LedgerConfig::default();
        assert_eq!(cfg.cooldown_secs, 10);
        assert!(cfg.persistence_enabled);
        assert_eq!(cfg.keys.wrap_scheme, WrapScheme::MasterKey);
        assert!(!cfg.keys.allow_dev_master_key);
    }

    #[test]
    fn file_fields_override_defaults() -> Result<()> {
        let file: LedgerConfigFile = serde_json::from_str(
            r#"{
                "db_path": "warehouse.db",
                "cooldown_secs": 30,
                "persistence_enabled": false,
                "keys": { "wrap_scheme": "master-key", "allow_dev_master_key": true }
            }"#,
        )?;
        let cfg = LedgerConfig::from_file(file)?;
        assert_eq!(cfg.db_path, "warehouse.db");
        assert_eq!(cfg.cooldown_secs, 30);
        assert!(!cfg.persistence_enabled);
        assert!(cfg.keys.allow_dev_master_key);
        Ok(())
    }

    #[test]
    fn kem_scheme_requires_key_paths() {
        let mut cfg = LedgerConfig::default();
        cfg.keys.wrap_scheme = WrapScheme::Kem;
        assert!(cfg.validate().is_err());

        cfg.keys.kem_public_path = Some(PathBuf::from("kem.pub"));
        cfg.keys.kem_secret_path = Some(PathBuf::from("kem.sec"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_cooldown_rejected() {
        let mut cfg = LedgerConfig::default();
        cfg.cooldown_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
