use anyhow::Result;
use std::sync::{Arc, Barrier};

use detection_ledger::{ClassCounts, Ledger, LedgerConfig, Principal};

const TEST_MASTER_KEY: &str = "00e1f2d3c4b5a6978897a6b5c4d3e2f1102132435465768798a9bacbdcedfe0f";

fn config_for(db_path: &str) -> LedgerConfig {
    let mut cfg = LedgerConfig {
        db_path: db_path.to_string(),
        ..LedgerConfig::default()
    };
    cfg.keys.master_key_hex = Some(TEST_MASTER_KEY.to_string());
    cfg
}

fn counts(pairs: &[(&str, u64)]) -> ClassCounts {
    pairs
        .iter()
        .map(|(name, count)| (name.to_string(), *count))
        .collect()
}

/// N concurrent first writes for a tenant with no key material must agree
/// on a single DEK: exactly one claim wins, the losers re-read it, and
/// every stored record decrypts afterwards.
#[test]
fn concurrent_first_writes_share_one_tenant_key() -> Result<()> {
    const WRITERS: usize = 6;

    let dir = tempfile::tempdir()?;
    let db_path = dir
        .path()
        .join("ledger.db")
        .to_str()
        .expect("utf-8 temp path")
        .to_string();
    let cfg = config_for(&db_path);

    let setup = Ledger::open(&cfg)?;
    let warehouse = setup.register_warehouse("contended warehouse")?;
    let camera = setup.register_camera(warehouse, "cam-1")?;
    drop(setup);

    let barrier = Arc::new(Barrier::new(WRITERS));
    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let ledger = Ledger::open(&cfg)?;
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || -> Result<i64> {
            let observed = counts(&[("sack", writer as u64 + 1)]);
            barrier.wait();
            // Direct store: the admission gate is per process instance and
            // not under test here.
            let record = ledger.store(camera, &observed, 1_000 + writer as u64)?;
            Ok(record.id)
        }));
    }

    let mut record_ids = Vec::new();
    for handle in handles {
        let id = handle.join().expect("writer thread panicked")?;
        record_ids.push(id);
    }
    assert_eq!(record_ids.len(), WRITERS);

    // Every record must decrypt under the single surviving tenant key.
    let reader = Ledger::open(&cfg)?;
    let admin = Principal::admin(1);
    for (writer, id) in record_ids.iter().enumerate() {
        let payload = reader.decrypt_detection(&admin, *id)?;
        assert_eq!(payload.total_count, writer as u64 + 1);
        assert_eq!(payload.dominant_class, "sack");
    }
    Ok(())
}
