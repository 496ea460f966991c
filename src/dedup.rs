//! Duplicate-capture suppression.
//!
//! Once a plate has been accepted, repeat recognitions of the same plate
//! are rejected until the cooldown window elapses. The key scope is a
//! deployment choice: per camera (and direction) for multi-gate sites
//! where the same vehicle legitimately passes several cameras, or global
//! when one plate should only ever be recorded once per window.
//!
//! Shared by every camera worker; all mutation happens under one lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupScope {
    /// Key on (camera, direction, plate).
    PerCamera,
    /// Key on plate text alone, across all cameras.
    Global,
}

impl DedupScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "per_camera" => Some(DedupScope::PerCamera),
            "global" => Some(DedupScope::Global),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct DedupKey {
    camera_id: Option<String>,
    direction: Option<String>,
    plate: String,
}

/// Cooldown map from dedup key to last-accepted timestamp.
pub struct Deduplicator {
    cooldown_s: u64,
    scope: DedupScope,
    seen: Mutex<HashMap<DedupKey, u64>>,
}

impl Deduplicator {
    pub fn new(cooldown: Duration, scope: DedupScope) -> Self {
        Self {
            cooldown_s: cooldown.as_secs(),
            scope,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Accept or reject a recognized plate at `now` (epoch seconds).
    /// Accepting refreshes the cooldown stamp.
    pub fn accept(
        &self,
        camera_id: &str,
        direction: Option<&str>,
        plate: &str,
        now: u64,
    ) -> bool {
        let key = match self.scope {
            DedupScope::PerCamera => DedupKey {
                camera_id: Some(camera_id.to_string()),
                direction: direction.map(str::to_string),
                plate: plate.to_string(),
            },
            DedupScope::Global => DedupKey {
                camera_id: None,
                direction: None,
                plate: plate.to_string(),
            },
        };

        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&last) = seen.get(&key) {
            if now.saturating_sub(last) < self.cooldown_s {
                log::debug!(
                    "duplicate {} on {} suppressed ({}s since last, cooldown {}s)",
                    plate,
                    camera_id,
                    now.saturating_sub(last),
                    self.cooldown_s
                );
                return false;
            }
        }
        seen.insert(key, now);

        // Opportunistic prune of expired entries.
        let cooldown = self.cooldown_s;
        seen.retain(|_, &mut last| now.saturating_sub(last) < cooldown);
        true
    }
}
