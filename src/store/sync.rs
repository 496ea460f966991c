//! Best-effort replication to a remote detection store.
//!
//! Sync never gates local persistence: rows are written locally first and
//! replicated whenever the remote is reachable, either inline right after
//! a write or by the periodic pass over unsynced rows. The remote is
//! expected to upsert on (camera_id, created_at, plate), so re-sending a
//! row after a lost acknowledgement is harmless.

use anyhow::{Context, Result};
use std::time::Duration;

use super::{DetectionRecord, DetectionStore};
use crate::config::SyncSettings;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_BATCH: usize = 100;

pub struct RemoteSync {
    agent: ureq::Agent,
    url: String,
    token: Option<String>,
}

impl RemoteSync {
    /// `None` when no remote is configured.
    pub fn from_settings(settings: &SyncSettings) -> Option<Self> {
        settings.remote_url.as_ref().map(|url| Self {
            agent: ureq::AgentBuilder::new()
                .timeout_read(REMOTE_TIMEOUT)
                .timeout_write(REMOTE_TIMEOUT)
                .build(),
            url: url.trim_end_matches('/').to_string(),
            token: settings.remote_token.clone(),
        })
    }

    /// Push one record to the remote store.
    pub fn push(&self, record: &DetectionRecord) -> Result<()> {
        let mut request = self.agent.post(&format!("{}/detections", self.url));
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        request
            .send_json(record_payload(record))
            .with_context(|| format!("sync detection {} to remote", record.plate))?;
        Ok(())
    }

    /// Replicate pending rows, oldest first. Stops at the first remote
    /// failure so one bad row does not stall behind retries of the rest;
    /// the next pass picks up where this one gave up.
    pub fn run_once(&self, store: &mut dyn DetectionStore) -> Result<usize> {
        let pending = store.unsynced(SYNC_BATCH)?;
        let mut pushed = 0;
        for record in &pending {
            if let Err(e) = self.push(record) {
                log::warn!("remote sync stopped after {} rows: {:#}", pushed, e);
                break;
            }
            if let Some(id) = record.id {
                store.mark_synced(id)?;
            }
            pushed += 1;
        }
        if pushed > 0 {
            log::info!("synced {} detection(s) to remote", pushed);
        }
        Ok(pushed)
    }
}

/// Wire shape for the remote store. (camera_id, created_at, plate) is the
/// upsert key.
fn record_payload(record: &DetectionRecord) -> serde_json::Value {
    serde_json::json!({
        "camera_id": record.camera_id,
        "created_at": record.created_at,
        "plate": record.plate,
        "vehicle_type": record.vehicle_type.as_str(),
        "confidence": record.confidence,
        "direction": record.direction,
        "engine": record.engine,
        "processing_ms": record.processing_ms,
    })
}
