//! platewatch - multi-camera ANPR capture pipeline.
//!
//! The crate turns live camera streams into durable plate detections:
//!
//! 1. `ingest` pulls timestamped frames per camera, with reconnect/backoff
//!    and a synthetic fallback so the pipeline never stalls.
//! 2. `motion` gates frames on a cheap per-camera background model.
//! 3. `detect` runs two-stage region detection (vehicles, then plates
//!    inside vehicle crops) behind a backend trait.
//! 4. `track` decides, per tracked plate region, when a crop is stable
//!    enough to be worth a recognition call.
//! 5. `quality`/`enhance` reject blurry crops and normalize the rest.
//! 6. `recognize` dispatches crops to external vision engines with
//!    single/fallback/compare policies.
//! 7. `plate` validates recognized text against national grammars and
//!    classifies the vehicle.
//! 8. `dedup` suppresses repeat captures inside a cooldown window.
//! 9. `store` writes every accepted detection locally first, then syncs
//!    best-effort to a remote endpoint and cleans up transient images.
//!
//! `pipeline` wires the stages into per-camera workers plus a shared
//! recognition worker behind a bounded queue.

use anyhow::{anyhow, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dedup;
pub mod detect;
pub mod enhance;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod plate;
pub mod quality;
pub mod recognize;
pub mod store;
pub mod track;

pub use config::Config;
pub use dedup::{DedupScope, Deduplicator};
pub use detect::{Detector, Region, RegionClass, StubDetector, TwoStageDetector};
pub use ingest::{Frame, FrameSource, SourceConfig};
pub use motion::{MotionGate, MotionReport};
pub use plate::{PlateGrammar, PlateValidator, VehicleType};
pub use recognize::{Dispatcher, Recognition, RecognitionEngine, RecognitionPolicy};
pub use store::{
    DetectionRecord, DetectionStore, MemoryDetectionStore, PersistenceCoordinator,
    SqliteDetectionStore,
};
pub use track::{CaptureCandidate, StabilityTracker, TrackState};

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock before epoch: {}", e))?
        .as_secs())
}

// -------------------- Bounding boxes --------------------

/// Axis-aligned bounding box in full-frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Translate by an offset (used to map plate boxes from a vehicle crop
    /// back into full-frame coordinates).
    pub fn offset(&self, dx: u32, dy: u32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Grow by `pad` pixels on every side, clamped to `width` x `height`.
    pub fn padded(&self, pad: u32, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.saturating_sub(pad),
            y1: self.y1.saturating_sub(pad),
            x2: (self.x2 + pad).min(width),
            y2: (self.y2 + pad).min(height),
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = u64::from(ix2 - ix1) * u64::from(iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union == 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}
