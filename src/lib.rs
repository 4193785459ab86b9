//! Secure detection ledger.
//!
//! This crate is the persistence core of a warehouse-surveillance system:
//! it decides whether a detection result may be written, seals the result
//! under per-tenant envelope encryption, and gates who may later recover
//! the plaintext. Frame capture, inference and the HTTP surface are
//! external collaborators.
//!
//! # Invariants
//!
//! 1. **Tenant isolation**: every warehouse owns exactly one DEK; records
//!    of different warehouses are never decryptable with the same key.
//! 2. **KEK discipline**: the master key only wraps and unwraps DEKs, it
//!    never touches payload bytes.
//! 3. **Fresh nonces**: every payload seal draws a new random nonce.
//! 4. **All-or-nothing payloads**: ciphertext, nonce and tag are persisted
//!    together or not at all.
//! 5. **Throttled admission**: at most one persisted detection per camera
//!    per cooldown window; rejected ticks are dropped, not queued.
//! 6. **Ownership-scoped reads**: administrators read everything, other
//!    principals only their own tenant, and a non-administrator cannot
//!    distinguish a foreign record from a missing one.
//!
//! # Module Structure
//!
//! - `keystore`: master key and KEM key-pair loading
//! - `envelope`: DEK lifecycle, wrap schemes, payload AEAD
//! - `ingest`: per-camera write admission
//! - `access`: roles and the authorization decision
//! - `storage`: SQLite schema and row mapping

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod access;
pub mod config;
pub mod envelope;
pub mod ingest;
pub mod keystore;
pub mod storage;

pub use access::{AccessGate, Principal, Role};
pub use config::{KeySettings, LedgerConfig};
pub use envelope::{Dek, KemKeypair, SealedPayload, TenantKeyMaterial, WrapScheme};
pub use ingest::{IngestionGate, DEFAULT_COOLDOWN_SECS};
pub use keystore::KeyStore;
pub use storage::CameraTotal;

use rand::RngCore;

/// Sentinel dominant-class name for a tick with no detected objects.
/// Never persisted as an object-class row.
pub const NONE_CLASS: &str = "none";

const FIRST_KEY_VERSION: u32 = 1;
const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------- Errors --------------------

/// Failure taxonomy of the ledger core. Carried inside `anyhow::Error`;
/// callers that need to branch downcast to this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerError {
    /// Master key missing, empty or malformed. Fatal at startup.
    KeyConfiguration(String),
    /// Asymmetric key pair absent or unreadable.
    KeyLoad(String),
    /// A wrapped DEK failed to unwrap (wrong key, version or tampering).
    Unwrap(String),
    /// Payload tag verification failed. Never retried.
    Authentication,
    /// Tenant key material could not be created or loaded; the write is
    /// dropped, the live path continues.
    TenantKeyUnavailable(String),
    Forbidden,
    NotFound,
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::KeyConfiguration(msg) => write!(f, "key configuration error: {}", msg),
            LedgerError::KeyLoad(msg) => write!(f, "key load error: {}", msg),
            LedgerError::Unwrap(msg) => write!(f, "DEK unwrap failed: {}", msg),
            LedgerError::Authentication => write!(f, "payload authentication failed"),
            LedgerError::TenantKeyUnavailable(msg) => {
                write!(f, "tenant key unavailable: {}", msg)
            }
            LedgerError::Forbidden => write!(f, "access denied"),
            LedgerError::NotFound => write!(f, "record not found"),
        }
    }
}

impl std::error::Error for LedgerError {}

// -------------------- Detection results --------------------

/// Detection outcome for one frame: class name -> object count.
pub type ClassCounts = BTreeMap<String, u64>;

/// Class names come from the detector model; enforce the same identifier
/// discipline as other local names so lookups stay canonical.
pub fn validate_class_name(name: &str) -> Result<()> {
    static CLASS_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CLASS_NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());

    if !re.is_match(name) {
        return Err(anyhow!(
            "class name must match ^[a-z0-9_-]{{1,64}}$ after lowercasing"
        ));
    }
    Ok(())
}

/// The class with the highest count; ties resolve to the
/// lexicographically first name. `None` when nothing was detected.
pub fn dominant_class(counts: &ClassCounts) -> Option<(&str, u64)> {
    let mut best: Option<(&str, u64)> = None;
    for (name, &count) in counts {
        if count == 0 {
            continue;
        }
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((name.as_str(), count)),
        }
    }
    best
}

/// The confidential body of a detection record. Field names on the wire
/// match the recorded-history format already in production databases.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionPayload {
    #[serde(rename = "total_karung")]
    pub total_count: u64,
    #[serde(rename = "nama_karung")]
    pub dominant_class: String,
    #[serde(rename = "waktu")]
    pub recorded_at: u64,
    #[serde(default)]
    pub counts: ClassCounts,
}

impl DetectionPayload {
    pub fn from_counts(counts: &ClassCounts, recorded_at: u64) -> Self {
        let total_count = counts.values().sum();
        let dominant = dominant_class(counts)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| NONE_CLASS.to_string());
        Self {
            total_count,
            dominant_class: dominant,
            recorded_at,
            counts: counts.clone(),
        }
    }
}

/// One persisted detection row. The plaintext total supports aggregate
/// queries; everything sensitive lives in the sealed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionRecord {
    pub id: i64,
    pub recorded_at: u64,
    pub camera_id: i64,
    pub class_id: Option<i64>,
    pub total_count: u64,
    pub sealed: Option<SealedPayload>,
}

// -------------------- Plumbing --------------------

pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:detection_ledger_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.busy_timeout(DB_BUSY_TIMEOUT)?;
    Ok(conn)
}

// -------------------- Ledger --------------------

/// The detection ledger: admission, envelope encryption and authorized
/// recovery over one SQLite database.
///
/// A `Ledger` is not shared across threads; concurrent writers open their
/// own instance against the same database path and coordinate through
/// SQLite (tenant-key creation is an atomic claim, see
/// [`storage::claim_tenant_key`]).
pub struct Ledger {
    conn: Connection,
    keystore: KeyStore,
    gate: IngestionGate,
    wrap_scheme: WrapScheme,
}

impl Ledger {
    /// Open the database and load key material. An unusable master key
    /// fails here, before any write is accepted.
    pub fn open(cfg: &LedgerConfig) -> Result<Self> {
        let keystore = KeyStore::load(cfg)?;
        let db_path = if cfg.db_path == ":memory:" {
            shared_memory_uri()
        } else {
            cfg.db_path.clone()
        };
        let conn = open_db_connection(&db_path)?;
        storage::ensure_schema(&conn)?;
        Ok(Self {
            conn,
            keystore,
            gate: IngestionGate::new(cfg.cooldown_secs, cfg.persistence_enabled),
            wrap_scheme: cfg.keys.wrap_scheme,
        })
    }

    pub fn ingestion_gate(&self) -> &IngestionGate {
        &self.gate
    }

    /// Toggle history persistence. Administrative action.
    pub fn set_persistence_enabled(&self, principal: &Principal, enabled: bool) -> Result<()> {
        if !principal.is_admin() {
            return Err(LedgerError::Forbidden.into());
        }
        self.gate.set_enabled(enabled);
        log::info!(
            "persistence {} by user {}",
            if enabled { "enabled" } else { "disabled" },
            principal.user_id
        );
        Ok(())
    }

    pub fn register_warehouse(&self, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("warehouse name must not be empty"));
        }
        storage::insert_warehouse(&self.conn, name)
    }

    pub fn register_camera(&self, warehouse_id: i64, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        storage::register_camera(&self.conn, warehouse_id, name)
    }

    /// Cascading tenant removal: cameras, detection history and key
    /// material go with the warehouse. Administrative action.
    pub fn delete_warehouse(&self, principal: &Principal, warehouse_id: i64) -> Result<()> {
        if !principal.is_admin() {
            return Err(LedgerError::Forbidden.into());
        }
        storage::delete_warehouse(&self.conn, warehouse_id)
    }

    /// The admission-then-store composition for the live detection path:
    /// `Ok(None)` when the gate rejects the tick or the tenant key is
    /// unavailable; the caller keeps streaming either way.
    pub fn observe(
        &self,
        camera_id: i64,
        counts: &ClassCounts,
        now_s: u64,
    ) -> Result<Option<DetectionRecord>> {
        if !self.gate.admit(camera_id, now_s) {
            return Ok(None);
        }
        match self.store(camera_id, counts, now_s) {
            Ok(record) => Ok(Some(record)),
            Err(err)
                if matches!(
                    err.downcast_ref::<LedgerError>(),
                    Some(LedgerError::TenantKeyUnavailable(_))
                ) =>
            {
                log::warn!(
                    "skipping persistence for camera {}: {}",
                    camera_id,
                    err
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Persist one admitted detection result, sealed under the owning
    /// tenant's DEK.
    pub fn store(
        &self,
        camera_id: i64,
        counts: &ClassCounts,
        now_s: u64,
    ) -> Result<DetectionRecord> {
        let warehouse_id = storage::camera_warehouse(&self.conn, camera_id)?
            .ok_or(LedgerError::NotFound)?;

        let material = self
            .ensure_tenant_key(warehouse_id)
            .map_err(as_tenant_key_unavailable)?;
        let dek = envelope::unwrap_dek(
            &material,
            warehouse_id,
            self.keystore.master_key(),
            self.keystore.kem_keypair(),
        )
        .map_err(|err| {
            log::warn!(
                "cannot unwrap tenant key for warehouse {} (store, camera {}): {}",
                warehouse_id,
                camera_id,
                err
            );
            as_tenant_key_unavailable(err)
        })?;

        let payload = DetectionPayload::from_counts(counts, now_s);
        let body = serde_json::to_vec(&payload)?;
        let sealed = envelope::seal_payload(&body, &dek)?;
        // DEK leaves working memory here, before any row is written.
        drop(dek);

        let class_id = if payload.dominant_class == NONE_CLASS {
            None
        } else {
            let name = payload.dominant_class.to_lowercase();
            validate_class_name(&name)?;
            Some(storage::resolve_class(&self.conn, &name)?)
        };

        let id = storage::insert_detection(
            &self.conn,
            now_s,
            camera_id,
            class_id,
            payload.total_count,
            Some(&sealed),
        )?;
        Ok(DetectionRecord {
            id,
            recorded_at: now_s,
            camera_id,
            class_id,
            total_count: payload.total_count,
            sealed: Some(sealed),
        })
    }

    /// Legacy aggregate-only write: plaintext total, no sealed payload.
    pub fn store_plain(&self, camera_id: i64, total: u64, now_s: u64) -> Result<DetectionRecord> {
        let _warehouse_id = storage::camera_warehouse(&self.conn, camera_id)?
            .ok_or(LedgerError::NotFound)?;
        let id = storage::insert_detection(&self.conn, now_s, camera_id, None, total, None)?;
        Ok(DetectionRecord {
            id,
            recorded_at: now_s,
            camera_id,
            class_id: None,
            total_count: total,
            sealed: None,
        })
    }

    pub fn retrieve(&self, detection_id: i64) -> Result<DetectionRecord> {
        storage::fetch_detection(&self.conn, detection_id)?
            .ok_or_else(|| LedgerError::NotFound.into())
    }

    /// Authorized recovery of a record's plaintext payload.
    ///
    /// Non-administrators get [`LedgerError::Forbidden`] for a record they
    /// do not own and for one that does not exist, indistinguishably, so
    /// record ids cannot be probed across tenants.
    pub fn decrypt_detection(
        &self,
        principal: &Principal,
        detection_id: i64,
    ) -> Result<DetectionPayload> {
        let record = match storage::fetch_detection(&self.conn, detection_id)? {
            Some(record) => record,
            None if principal.is_admin() => return Err(LedgerError::NotFound.into()),
            None => return Err(LedgerError::Forbidden.into()),
        };

        let warehouse_id = storage::camera_warehouse(&self.conn, record.camera_id)?
            .ok_or_else(|| anyhow!("corrupt detection {}: dangling camera", detection_id))?;
        AccessGate::authorize(principal, warehouse_id)?;

        let Some(sealed) = record.sealed.as_ref() else {
            return Err(LedgerError::NotFound.into());
        };

        let material = storage::warehouse_key_material(&self.conn, warehouse_id)?.ok_or_else(
            || {
                LedgerError::TenantKeyUnavailable(format!(
                    "warehouse {} has no key material",
                    warehouse_id
                ))
            },
        )?;
        let dek = envelope::unwrap_dek(
            &material,
            warehouse_id,
            self.keystore.master_key(),
            self.keystore.kem_keypair(),
        )
        .map_err(|err| {
            log::warn!(
                "cannot unwrap tenant key for warehouse {} (decrypt, detection {}): {}",
                warehouse_id,
                detection_id,
                err
            );
            err
        })?;

        let body = envelope::open_payload(sealed, &dek).map_err(|err| {
            log::warn!(
                "payload authentication failed for detection {} (warehouse {})",
                detection_id,
                warehouse_id
            );
            err
        })?;
        drop(dek);

        let payload = serde_json::from_slice(&body)
            .map_err(|e| anyhow!("corrupt payload for detection {}: {}", detection_id, e))?;
        Ok(payload)
    }

    pub fn camera_totals(&self, warehouse_id: i64) -> Result<Vec<CameraTotal>> {
        storage::camera_totals(&self.conn, warehouse_id)
    }

    /// Fetch-or-create the tenant's wrapped DEK. First write per tenant
    /// races; the claim is atomic and a losing creator discards its DEK
    /// (zeroed on drop) and re-reads the winner's material.
    fn ensure_tenant_key(&self, warehouse_id: i64) -> Result<TenantKeyMaterial> {
        if let Some(material) = storage::warehouse_key_material(&self.conn, warehouse_id)? {
            return Ok(material);
        }

        let dek = Dek::generate();
        let material = envelope::wrap_dek(
            &dek,
            warehouse_id,
            FIRST_KEY_VERSION,
            self.wrap_scheme,
            self.keystore.master_key(),
            self.keystore.kem_keypair(),
        )?;
        drop(dek);

        if storage::claim_tenant_key(&self.conn, warehouse_id, &material)? {
            log::info!("created key material for warehouse {}", warehouse_id);
            return Ok(material);
        }

        storage::warehouse_key_material(&self.conn, warehouse_id)?.ok_or_else(|| {
            LedgerError::TenantKeyUnavailable(format!(
                "warehouse {} key claim lost but no material found",
                warehouse_id
            ))
            .into()
        })
    }
}

fn as_tenant_key_unavailable(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::TenantKeyUnavailable(_)) => err,
        _ => LedgerError::TenantKeyUnavailable(err.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u64)]) -> ClassCounts {
        pairs
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect()
    }

    #[test]
    fn dominant_class_prefers_highest_count() {
        let c = counts(&[("box", 1), ("sack", 3)]);
        assert_eq!(dominant_class(&c), Some(("sack", 3)));
    }

    #[test]
    fn dominant_class_tie_breaks_lexicographically() {
        let c = counts(&[("sack", 2), ("box", 2)]);
        assert_eq!(dominant_class(&c), Some(("box", 2)));
    }

    #[test]
    fn dominant_class_ignores_zero_counts() {
        let c = counts(&[("sack", 0)]);
        assert_eq!(dominant_class(&c), None);
        assert_eq!(
            DetectionPayload::from_counts(&c, 7).dominant_class,
            NONE_CLASS
        );
    }

    #[test]
    fn payload_wire_names_are_stable() {
        let payload = DetectionPayload::from_counts(&counts(&[("sack", 3), ("box", 1)]), 42);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["total_karung"], 4);
        assert_eq!(value["nama_karung"], "sack");
        assert_eq!(value["waktu"], 42);
        assert_eq!(value["counts"]["box"], 1);
    }

    #[test]
    fn class_name_discipline() {
        assert!(validate_class_name("sack").is_ok());
        assert!(validate_class_name("pallet_02").is_ok());
        assert!(validate_class_name("").is_err());
        assert!(validate_class_name("Sack").is_err());
        assert!(validate_class_name("sack crate").is_err());
    }
}
