//! Motion gating.
//!
//! Keeps a per-camera exponential background estimate over luma pixels and
//! classifies each frame as "has motion" or "static" at a fraction of the
//! cost of region detection. The learning rate is deliberately slow: a
//! vehicle that parks in view must eventually be absorbed into the
//! background rather than flagged as motion forever. That absorption is an
//! accuracy requirement, not an optimization.

use crate::config::MotionSettings;
use crate::ingest::Frame;

/// Classification of a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionReport {
    pub is_motion: bool,
    /// Number of pixels deviating from the background model.
    pub foreground_area: u32,
}

/// Rolling background model for one camera.
///
/// No persisted state; reset on camera reconnect.
pub struct MotionGate {
    settings: MotionSettings,
    background: Vec<f32>,
    width: u32,
    height: u32,
    static_run: u32,
}

impl MotionGate {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            background: Vec::new(),
            width: 0,
            height: 0,
            static_run: 0,
        }
    }

    /// Update the background estimate and classify the frame.
    pub fn classify(&mut self, frame: &Frame) -> MotionReport {
        if self.background.len() != frame.pixels.len()
            || self.width != frame.width
            || self.height != frame.height
        {
            // First frame (or resolution change): seed and report static.
            self.seed(frame);
            return MotionReport {
                is_motion: false,
                foreground_area: 0,
            };
        }

        let alpha = self.settings.learning_rate;
        let diff_threshold = f32::from(self.settings.diff_threshold);
        let mut foreground_area = 0u32;
        for (bg, &pixel) in self.background.iter_mut().zip(frame.pixels.iter()) {
            let value = f32::from(pixel);
            if (value - *bg).abs() > diff_threshold {
                foreground_area += 1;
            }
            *bg += alpha * (value - *bg);
        }

        let is_motion = foreground_area >= self.settings.min_area;
        if is_motion {
            self.static_run = 0;
        } else {
            self.static_run += 1;
            // A long static run means the scene has settled (or lighting
            // drifted); re-seed so residual ghosting clears immediately.
            if self.static_run >= self.settings.reseed_after_static_frames {
                self.seed(frame);
            }
        }

        MotionReport {
            is_motion,
            foreground_area,
        }
    }

    /// Discard the model, e.g. on camera reconnect.
    pub fn reset(&mut self) {
        self.background.clear();
        self.width = 0;
        self.height = 0;
        self.static_run = 0;
    }

    fn seed(&mut self, frame: &Frame) {
        self.background = frame.pixels.iter().map(|&p| f32::from(p)).collect();
        self.width = frame.width;
        self.height = frame.height;
        self.static_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MotionSettings {
        MotionSettings {
            learning_rate: 0.05,
            diff_threshold: 25,
            min_area: 100,
            reseed_after_static_frames: 10,
        }
    }

    fn frame(pixels: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            camera_id: "cam".to_string(),
            seq: 0,
            timestamp: 0,
            pixels,
            width,
            height,
            synthetic: false,
        }
    }

    #[test]
    fn static_scene_stays_quiet() {
        let mut gate = MotionGate::new(settings());
        let background = frame(vec![60u8; 64 * 64], 64, 64);
        gate.classify(&background);
        let report = gate.classify(&background);
        assert!(!report.is_motion);
        assert_eq!(report.foreground_area, 0);
    }

    #[test]
    fn large_change_triggers_motion() {
        let mut gate = MotionGate::new(settings());
        gate.classify(&frame(vec![60u8; 64 * 64], 64, 64));

        // A bright object covering a quarter of the frame.
        let mut pixels = vec![60u8; 64 * 64];
        for p in pixels.iter_mut().take(64 * 16) {
            *p = 230;
        }
        let report = gate.classify(&frame(pixels, 64, 64));
        assert!(report.is_motion);
        assert!(report.foreground_area >= 64 * 16);
    }

    #[test]
    fn stationary_object_is_absorbed_into_background() {
        let mut gate = MotionGate::new(MotionSettings {
            learning_rate: 0.2,
            ..settings()
        });
        gate.classify(&frame(vec![60u8; 64 * 64], 64, 64));

        let mut pixels = vec![60u8; 64 * 64];
        for p in pixels.iter_mut().take(64 * 16) {
            *p = 230;
        }
        let parked = frame(pixels, 64, 64);

        // Keep feeding the identical "parked vehicle" frame; the model
        // must eventually stop reporting motion.
        let mut absorbed = false;
        for _ in 0..200 {
            if !gate.classify(&parked).is_motion {
                absorbed = true;
                break;
            }
        }
        assert!(absorbed, "stationary object was never absorbed");
    }

    #[test]
    fn reset_discards_model() {
        let mut gate = MotionGate::new(settings());
        gate.classify(&frame(vec![60u8; 64 * 64], 64, 64));
        gate.reset();

        // After reset the next frame re-seeds and reports static even if
        // it is completely different.
        let report = gate.classify(&frame(vec![200u8; 64 * 64], 64, 64));
        assert!(!report.is_motion);
    }
}
