//! Transient ROI image cleanup.
//!
//! Crop images exist to feed the recognition engines and the remote
//! store; once a row has synced, or has sat unsynced past the grace
//! period, its ROI file is deleted and the path cleared. Full-frame
//! context images are kept.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use super::DetectionStore;

pub struct ImageCleanup {
    grace: Duration,
}

impl ImageCleanup {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// One sweep at `now` (epoch seconds). Returns how many images were
    /// removed. A missing file still clears the path; a file that cannot
    /// be removed is left for the next sweep.
    pub fn sweep(&self, store: &mut dyn DetectionStore, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(self.grace.as_secs());
        let mut removed = 0;
        for record in store.cleanup_candidates(cutoff)? {
            let (Some(id), Some(path)) = (record.id, record.roi_image_path.as_deref()) else {
                continue;
            };
            match remove_if_present(Path::new(path)) {
                Ok(()) => {
                    store.clear_roi_path(id)?;
                    removed += 1;
                }
                Err(e) => log::warn!("could not remove roi image {}: {}", path, e),
            }
        }
        if removed > 0 {
            log::debug!("cleanup removed {} roi image(s)", removed);
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
