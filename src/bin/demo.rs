//! demo - end-to-end synthetic run for the detection ledger
//!
//! Registers a tenant and a camera, feeds a few synthetic detection
//! results through the admission gate, then recovers the sealed payloads
//! as an administrator and shows the cross-tenant denial.

use anyhow::Result;
use clap::Parser;

use detection_ledger::{now_s, ClassCounts, Ledger, LedgerConfig, LedgerError, Principal};

const DEFAULT_DB_PATH: &str = "demo_ledger.db";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Database path for the demo run.
    #[arg(long, env = "LEDGER_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db: String,
    /// Persistence cooldown in seconds.
    #[arg(long, default_value_t = 10)]
    cooldown: u64,
}

fn counts(pairs: &[(&str, u64)]) -> ClassCounts {
    pairs
        .iter()
        .map(|(name, count)| (name.to_string(), *count))
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = LedgerConfig {
        db_path: args.db.clone(),
        cooldown_secs: args.cooldown,
        ..LedgerConfig::default()
    };
    if let Ok(key) = std::env::var("LEDGER_MASTER_KEY") {
        cfg.keys.master_key_hex = Some(key);
    } else {
        cfg.keys.allow_dev_master_key = true;
    }

    let ledger = Ledger::open(&cfg)?;

    let warehouse = ledger.register_warehouse("demo warehouse")?;
    let other_warehouse = ledger.register_warehouse("other warehouse")?;
    let camera = ledger.register_camera(warehouse, "dock-cam-1")?;
    log::info!("registered camera {} in warehouse {}", camera, warehouse);

    let t0 = now_s()?;
    let frames = [
        (t0, counts(&[("sack", 3), ("box", 1)])),
        // Inside the cooldown window: dropped by the gate.
        (t0 + 2, counts(&[("sack", 4)])),
        (t0 + args.cooldown + 1, counts(&[("sack", 5), ("box", 2)])),
    ];

    let mut stored = Vec::new();
    for (tick, frame_counts) in &frames {
        match ledger.observe(camera, frame_counts, *tick)? {
            Some(record) => {
                log::info!(
                    "persisted detection {} (total {})",
                    record.id,
                    record.total_count
                );
                stored.push(record.id);
            }
            None => log::info!("tick at t+{} dropped by the gate", tick - t0),
        }
    }

    let admin = Principal::admin(1);
    for id in &stored {
        let payload = ledger.decrypt_detection(&admin, *id)?;
        log::info!(
            "detection {}: total={} dominant={} breakdown={:?}",
            id,
            payload.total_count,
            payload.dominant_class,
            payload.counts
        );
    }

    // An operator from the other tenant is denied, indistinguishably from
    // a missing record.
    let outsider = Principal::operator(2, other_warehouse);
    if let Some(id) = stored.first() {
        let err = match ledger.decrypt_detection(&outsider, *id) {
            Ok(_) => return Err(anyhow::anyhow!("cross-tenant decrypt unexpectedly succeeded")),
            Err(err) => err,
        };
        match err.downcast_ref::<LedgerError>() {
            Some(LedgerError::Forbidden) => log::info!("cross-tenant decrypt denied, as designed"),
            _ => return Err(err),
        }
    }

    for total in ledger.camera_totals(warehouse)? {
        log::info!(
            "camera {} ({}): {} detections, {} objects",
            total.camera_id,
            total.camera_name,
            total.detections,
            total.total_count
        );
    }

    Ok(())
}
