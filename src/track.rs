//! Plate-region stability tracking.
//!
//! One `StabilityTracker` per camera. Each physically distinct plate
//! candidate under observation is a `Track` running the state machine
//!
//! ```text
//! New -> Stabilizing -> Captured -> (cooldown) -> Lost
//! ```
//!
//! A track emits exactly one capture when its bounding box has been
//! positionally stable for the configured number of consecutive frames.
//! After the capture it sits in a cooldown window during which the same
//! physical region is ignored for recapture, then it is discarded. Tracks
//! that stop matching regions are dropped after a miss timeout.
//!
//! Thresholds are configuration: camera distance and resolution change
//! what "stable" means in pixels.

use std::collections::VecDeque;

use crate::config::StabilitySettings;
use crate::detect::Region;
use crate::BBox;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    New,
    Stabilizing,
    Captured,
    Lost,
}

/// A temporally linked sequence of regions believed to be one plate.
#[derive(Debug)]
pub struct Track {
    pub id: u64,
    pub state: TrackState,
    pub bbox: BBox,
    pub confidence: f32,
    buffer: VecDeque<BBox>,
    stable_streak: u32,
    misses: u32,
    pub created_at: u64,
    pub last_seen: u64,
    captured_at: Option<u64>,
}

impl Track {
    fn new(id: u64, region: &Region, now: u64) -> Self {
        let mut buffer = VecDeque::new();
        buffer.push_back(region.bbox);
        Self {
            id,
            state: TrackState::New,
            bbox: region.bbox,
            confidence: region.confidence,
            buffer,
            stable_streak: 0,
            misses: 0,
            created_at: now,
            last_seen: now,
            captured_at: None,
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stable_streak(&self) -> u32 {
        self.stable_streak
    }

    /// Max per-coordinate positional variance across the buffer.
    fn positional_variance(&self) -> f32 {
        let n = self.buffer.len() as f32;
        if n < 2.0 {
            return f32::MAX;
        }
        let mut sums = [0.0f32; 4];
        for b in &self.buffer {
            sums[0] += b.x1 as f32;
            sums[1] += b.y1 as f32;
            sums[2] += b.x2 as f32;
            sums[3] += b.y2 as f32;
        }
        let means = sums.map(|s| s / n);
        let mut vars = [0.0f32; 4];
        for b in &self.buffer {
            let coords = [b.x1 as f32, b.y1 as f32, b.x2 as f32, b.y2 as f32];
            for (v, (c, m)) in vars.iter_mut().zip(coords.iter().zip(means.iter())) {
                *v += (c - m) * (c - m);
            }
        }
        vars.iter().map(|v| v / n).fold(0.0f32, f32::max)
    }
}

/// A stable crop worth a recognition call.
#[derive(Clone, Debug)]
pub struct CaptureCandidate {
    pub track_id: u64,
    pub bbox: BBox,
    pub confidence: f32,
    pub timestamp: u64,
}

/// Per-camera track set. Never shared across cameras.
pub struct StabilityTracker {
    settings: StabilitySettings,
    tracks: Vec<Track>,
    next_id: u64,
}

impl StabilityTracker {
    pub fn new(settings: StabilitySettings) -> Self {
        Self {
            settings,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Feed one frame's plate regions; returns the captures to emit.
    pub fn observe(&mut self, now: u64, regions: &[Region]) -> Vec<CaptureCandidate> {
        let assignments = self.assign(regions);
        let mut captures = Vec::new();
        let mut region_used = vec![false; regions.len()];
        let mut touched = vec![false; self.tracks.len()];

        for (track_idx, region_idx) in assignments {
            region_used[region_idx] = true;
            touched[track_idx] = true;
            if let Some(capture) =
                self.advance(track_idx, &regions[region_idx], now)
            {
                captures.push(capture);
            }
        }

        self.sweep(now, &touched);

        // Unmatched regions start new candidate tracks (after the sweep,
        // so a freshly created track cannot be charged a miss).
        for (idx, region) in regions.iter().enumerate() {
            if !region_used[idx] {
                let track = Track::new(self.next_id, region, now);
                log::debug!("track {} created at {:?}", track.id, track.bbox);
                self.next_id += 1;
                self.tracks.push(track);
            }
        }

        captures
    }

    /// QualityGate rejection path: a blurry capture returns the track to
    /// Stabilizing so a sharper frame can supersede it.
    pub fn reopen(&mut self, track_id: u64) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            if track.state == TrackState::Captured {
                track.state = TrackState::Stabilizing;
                track.stable_streak = 0;
                track.captured_at = None;
                log::debug!("track {} reopened after quality rejection", track_id);
            }
        }
    }

    /// Discard all tracks (camera disconnect / shutdown).
    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Greedy track/region matching by IoU. When several regions overlap
    /// one track, the higher-confidence region wins; the loser seeds a
    /// new track via the unmatched path.
    fn assign(&mut self, regions: &[Region]) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize, f32, f32)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (r, region) in regions.iter().enumerate() {
                let iou = track.bbox.iou(&region.bbox);
                if iou >= self.settings.match_iou {
                    pairs.push((t, r, iou, region.confidence));
                }
            }
        }
        // Confidence first, IoU as the tie-break.
        pairs.sort_by(|a, b| {
            b.3.partial_cmp(&a.3)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut region_used = vec![false; regions.len()];
        let mut assignments = Vec::new();
        for (t, r, _, _) in pairs {
            if track_used[t] || region_used[r] {
                continue;
            }
            track_used[t] = true;
            region_used[r] = true;
            assignments.push((t, r));
        }
        assignments
    }

    fn advance(&mut self, track_idx: usize, region: &Region, now: u64) -> Option<CaptureCandidate> {
        let required = self.settings.required_stable_frames;
        let variance_threshold = self.settings.variance_threshold;
        let buffer_len = self.settings.buffer_len;
        let track = &mut self.tracks[track_idx];

        track.misses = 0;
        track.last_seen = now;
        track.bbox = region.bbox;
        track.confidence = region.confidence;
        track.buffer.push_back(region.bbox);
        while track.buffer.len() > buffer_len {
            track.buffer.pop_front();
        }

        // The first matched frame starts stabilizing immediately; it must
        // count toward the streak so exactly N stable frames capture.
        if track.state == TrackState::New {
            track.state = TrackState::Stabilizing;
        }

        match track.state {
            TrackState::Stabilizing => {
                let variance = track.positional_variance();
                if variance < variance_threshold {
                    track.stable_streak += 1;
                    log::debug!(
                        "track {} stabilizing {}/{} (variance {:.2})",
                        track.id,
                        track.stable_streak,
                        required,
                        variance
                    );
                } else {
                    // Moving again; bleed off the streak rather than
                    // zeroing it, matching observed plate jitter.
                    track.stable_streak = track.stable_streak.saturating_sub(1);
                    log::debug!("track {} unstable (variance {:.2})", track.id, variance);
                }
                if track.stable_streak >= required {
                    track.state = TrackState::Captured;
                    track.captured_at = Some(now);
                    log::info!(
                        "track {} captured at {:?} (confidence {:.2})",
                        track.id,
                        track.bbox,
                        track.confidence
                    );
                    return Some(CaptureCandidate {
                        track_id: track.id,
                        bbox: track.bbox,
                        confidence: track.confidence,
                        timestamp: now,
                    });
                }
                None
            }
            // Cooldown: keep following the region, emit nothing.
            TrackState::Captured => None,
            TrackState::New | TrackState::Lost => None,
        }
    }

    /// Miss accounting and track expiry. `touched[i]` marks tracks that
    /// matched a region this frame.
    fn sweep(&mut self, now: u64, touched: &[bool]) {
        let miss_timeout = self.settings.miss_timeout;
        let cooldown = self.settings.recapture_cooldown.as_secs();
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if !touched.get(idx).copied().unwrap_or(false) {
                track.misses += 1;
            }
            if track.misses >= miss_timeout {
                log::debug!("track {} lost after {} misses", track.id, track.misses);
                track.state = TrackState::Lost;
            }
            if let Some(captured_at) = track.captured_at {
                if now.saturating_sub(captured_at) >= cooldown {
                    log::debug!("track {} cooldown elapsed", track.id);
                    track.state = TrackState::Lost;
                }
            }
        }
        self.tracks.retain(|t| t.state != TrackState::Lost);
    }
}
