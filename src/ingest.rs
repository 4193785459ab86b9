//! Write admission for detection results.
//!
//! Persistence is throttled per camera: a camera's detections are written
//! at most once per cooldown window, and a global switch can disable
//! history persistence entirely. Rejected ticks are dropped, never queued;
//! the caller's live annotated-frame path is unaffected.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_COOLDOWN_SECS: u64 = 10;

struct GateState {
    enabled: bool,
    // camera id -> epoch seconds of the last admitted write
    last_admitted: HashMap<i64, u64>,
}

/// Per-camera rate limiter plus the global persistence switch. One lock
/// covers both so concurrent `admit` calls for the same camera resolve to
/// exactly one winner per cooldown window.
pub struct IngestionGate {
    cooldown_secs: u64,
    state: Mutex<GateState>,
}

impl IngestionGate {
    pub fn new(cooldown_secs: u64, enabled: bool) -> Self {
        Self {
            cooldown_secs,
            state: Mutex::new(GateState {
                enabled,
                last_admitted: HashMap::new(),
            }),
        }
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    pub fn is_persistence_enabled(&self) -> bool {
        self.lock_state().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock_state().enabled = enabled;
    }

    /// Admit a write for `camera_id` at time `now_s` if persistence is
    /// enabled and the camera's cooldown has elapsed. Admission records
    /// the timestamp, so two racing calls cannot both win a window.
    pub fn admit(&self, camera_id: i64, now_s: u64) -> bool {
        let mut state = self.lock_state();
        if !state.enabled {
            return false;
        }
        if let Some(last) = state.last_admitted.get(&camera_id) {
            if now_s.saturating_sub(*last) < self.cooldown_secs {
                return false;
            }
        }
        state.last_admitted.insert(camera_id, now_s);
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IngestionGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_SECS, true)
    }
}
