//! SQLite persistence for warehouses, cameras, object classes and
//! detection rows.
//!
//! Detection rows are immutable after insert and disappear only through
//! the cascade when their camera or warehouse is deleted. The payload
//! columns (ciphertext, nonce, tag) are constrained to be set or null as
//! a unit.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::envelope::{SealedPayload, TenantKeyMaterial, NONCE_LEN, TAG_LEN};
use crate::{DetectionRecord, LedgerError};

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS warehouses (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          wrapped_dek BLOB,
          key_version INTEGER NOT NULL DEFAULT 0,
          wrap_scheme TEXT
        );

        CREATE TABLE IF NOT EXISTS cameras (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          warehouse_id INTEGER NOT NULL REFERENCES warehouses(id) ON DELETE CASCADE,
          UNIQUE(name, warehouse_id)
        );

        CREATE TABLE IF NOT EXISTS object_classes (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS detections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          recorded_at INTEGER NOT NULL,
          camera_id INTEGER NOT NULL REFERENCES cameras(id) ON DELETE CASCADE,
          class_id INTEGER REFERENCES object_classes(id),
          total_count INTEGER NOT NULL,
          ciphertext BLOB,
          nonce BLOB,
          tag BLOB,
          CHECK (
            (ciphertext IS NULL AND nonce IS NULL AND tag IS NULL)
            OR (ciphertext IS NOT NULL AND nonce IS NOT NULL AND tag IS NOT NULL)
          )
        );

        CREATE INDEX IF NOT EXISTS idx_detections_camera
          ON detections(camera_id, recorded_at);
        "#,
    )?;
    Ok(())
}

pub(crate) fn insert_warehouse(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO warehouses(name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn warehouse_exists(conn: &Connection, warehouse_id: i64) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT id FROM warehouses WHERE id = ?1",
            params![warehouse_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

/// Read a warehouse's wrapped key material. `Ok(None)` means the tenant
/// exists but has no key yet; an unknown warehouse is `NotFound`.
pub(crate) fn warehouse_key_material(
    conn: &Connection,
    warehouse_id: i64,
) -> Result<Option<TenantKeyMaterial>> {
    let row: Option<(Option<Vec<u8>>, i64, Option<String>)> = conn
        .query_row(
            "SELECT wrapped_dek, key_version, wrap_scheme FROM warehouses WHERE id = ?1",
            params![warehouse_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((wrapped, key_version, scheme)) = row else {
        return Err(LedgerError::NotFound.into());
    };

    match (wrapped, scheme) {
        (None, _) => Ok(None),
        (Some(wrapped), Some(scheme)) => {
            let scheme = scheme.parse().map_err(|e| {
                anyhow!("corrupt warehouses.wrap_scheme for {}: {}", warehouse_id, e)
            })?;
            let key_version = u32::try_from(key_version)
                .map_err(|_| anyhow!("corrupt warehouses.key_version for {}", warehouse_id))?;
            Ok(Some(TenantKeyMaterial {
                scheme,
                key_version,
                wrapped,
            }))
        }
        (Some(_), None) => Err(anyhow!(
            "corrupt warehouse {}: wrapped_dek without wrap_scheme",
            warehouse_id
        )),
    }
}

/// Atomically install key material for a tenant that has none. Returns
/// false when a concurrent creator already won; the caller must discard
/// its DEK and re-read the winner's material.
pub(crate) fn claim_tenant_key(
    conn: &Connection,
    warehouse_id: i64,
    material: &TenantKeyMaterial,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE warehouses SET wrapped_dek = ?1, key_version = ?2, wrap_scheme = ?3
         WHERE id = ?4 AND wrapped_dek IS NULL",
        params![
            material.wrapped,
            material.key_version,
            material.scheme.to_string(),
            warehouse_id
        ],
    )?;
    Ok(updated == 1)
}

/// Idempotent camera registration: an existing `(name, warehouse)` pair
/// returns the existing id.
pub(crate) fn register_camera(conn: &Connection, warehouse_id: i64, name: &str) -> Result<i64> {
    if !warehouse_exists(conn, warehouse_id)? {
        return Err(LedgerError::NotFound.into());
    }
    conn.execute(
        "INSERT OR IGNORE INTO cameras(name, warehouse_id) VALUES (?1, ?2)",
        params![name, warehouse_id],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM cameras WHERE name = ?1 AND warehouse_id = ?2",
        params![name, warehouse_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn camera_warehouse(conn: &Connection, camera_id: i64) -> Result<Option<i64>> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT warehouse_id FROM cameras WHERE id = ?1",
            params![camera_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row)
}

/// Dedup lookup of a detected class name, creating the row on first
/// sighting.
pub(crate) fn resolve_class(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO object_classes(name) VALUES (?1)",
        params![name],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM object_classes WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn insert_detection(
    conn: &Connection,
    recorded_at: u64,
    camera_id: i64,
    class_id: Option<i64>,
    total_count: u64,
    sealed: Option<&SealedPayload>,
) -> Result<i64> {
    let recorded_at = i64::try_from(recorded_at)
        .map_err(|_| anyhow!("detection timestamp exceeds i64 range"))?;
    let total_count = i64::try_from(total_count)
        .map_err(|_| anyhow!("detection total count exceeds i64 range"))?;
    conn.execute(
        r#"
        INSERT INTO detections(recorded_at, camera_id, class_id, total_count, ciphertext, nonce, tag)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            recorded_at,
            camera_id,
            class_id,
            total_count,
            sealed.map(|s| s.ciphertext.as_slice()),
            sealed.map(|s| s.nonce.as_slice()),
            sealed.map(|s| s.tag.as_slice()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn fetch_detection(
    conn: &Connection,
    detection_id: i64,
) -> Result<Option<DetectionRecord>> {
    type Row = (
        i64,
        i64,
        Option<i64>,
        i64,
        Option<Vec<u8>>,
        Option<Vec<u8>>,
        Option<Vec<u8>>,
    );
    let row: Option<Row> = conn
        .query_row(
            "SELECT recorded_at, camera_id, class_id, total_count, ciphertext, nonce, tag
             FROM detections WHERE id = ?1",
            params![detection_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    let Some((recorded_at, camera_id, class_id, total_count, ciphertext, nonce, tag)) = row else {
        return Ok(None);
    };

    let sealed = match (ciphertext, nonce, tag) {
        (None, None, None) => None,
        (Some(ciphertext), Some(nonce), Some(tag)) => Some(SealedPayload {
            ciphertext,
            nonce: blob_array::<NONCE_LEN>(nonce, "detections.nonce")?,
            tag: blob_array::<TAG_LEN>(tag, "detections.tag")?,
        }),
        _ => {
            return Err(anyhow!(
                "corrupt detection {}: partial encrypted payload",
                detection_id
            ))
        }
    };

    Ok(Some(DetectionRecord {
        id: detection_id,
        recorded_at: u64::try_from(recorded_at)
            .map_err(|_| anyhow!("corrupt detection {}: negative timestamp", detection_id))?,
        camera_id,
        class_id,
        total_count: u64::try_from(total_count)
            .map_err(|_| anyhow!("corrupt detection {}: negative total", detection_id))?,
        sealed,
    }))
}

/// Aggregate of the plaintext totals, per camera of one warehouse. This
/// is the non-sensitive view the dashboard renders; the per-class
/// breakdown stays inside the encrypted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraTotal {
    pub camera_id: i64,
    pub camera_name: String,
    pub detections: u64,
    pub total_count: u64,
}

pub(crate) fn camera_totals(conn: &Connection, warehouse_id: i64) -> Result<Vec<CameraTotal>> {
    if !warehouse_exists(conn, warehouse_id)? {
        return Err(LedgerError::NotFound.into());
    }
    let mut stmt = conn.prepare(
        r#"
        SELECT c.id, c.name, COUNT(d.id), COALESCE(SUM(d.total_count), 0)
        FROM cameras c
        LEFT JOIN detections d ON d.camera_id = c.id
        WHERE c.warehouse_id = ?1
        GROUP BY c.id, c.name
        ORDER BY c.id
        "#,
    )?;
    let mut rows = stmt.query(params![warehouse_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let camera_id: i64 = row.get(0)?;
        let camera_name: String = row.get(1)?;
        let detections: i64 = row.get(2)?;
        let total_count: i64 = row.get(3)?;
        out.push(CameraTotal {
            camera_id,
            camera_name,
            detections: u64::try_from(detections).unwrap_or(0),
            total_count: u64::try_from(total_count)
                .map_err(|_| anyhow!("corrupt totals for camera {}", camera_id))?,
        });
    }
    Ok(out)
}

/// Remove a tenant and everything it owns: cameras and detections go with
/// the cascade, and the wrapped key material goes with the row.
pub(crate) fn delete_warehouse(conn: &Connection, warehouse_id: i64) -> Result<()> {
    let deleted = conn.execute("DELETE FROM warehouses WHERE id = ?1", params![warehouse_id])?;
    if deleted == 0 {
        return Err(LedgerError::NotFound.into());
    }
    Ok(())
}

fn blob_array<const N: usize>(bytes: Vec<u8>, column: &str) -> Result<[u8; N]> {
    if bytes.len() != N {
        return Err(anyhow!(
            "corrupt {}: expected {} bytes, got {}",
            column,
            N,
            bytes.len()
        ));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}
