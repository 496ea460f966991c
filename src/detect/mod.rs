//! Two-stage region detection.
//!
//! Stage 1 finds vehicle regions in the full frame; stage 2 searches for
//! plates only inside those vehicle crops, at a lower confidence threshold
//! (plates are small and often partially occluded). Restricting the plate
//! search to vehicle crops removes background text/signage false positives
//! and cuts detector cost by orders of magnitude versus full-frame search.
//!
//! The detector model itself is an external capability behind the
//! `Detector` trait; a failing backend yields zero regions, never a
//! pipeline error.

mod backend;
mod stub;

pub use backend::{Detector, Region, RegionClass};
pub use stub::StubDetector;

use crate::config::DetectSettings;
use crate::ingest::Frame;

/// Vehicle-then-plate detection glue.
pub struct TwoStageDetector {
    vehicle_backend: Box<dyn Detector>,
    plate_backend: Box<dyn Detector>,
    settings: DetectSettings,
}

impl TwoStageDetector {
    pub fn new(
        vehicle_backend: Box<dyn Detector>,
        plate_backend: Box<dyn Detector>,
        settings: DetectSettings,
    ) -> Self {
        Self {
            vehicle_backend,
            plate_backend,
            settings,
        }
    }

    /// Detect plate regions in a frame, in full-frame coordinates.
    ///
    /// Returns `(vehicles, plates)`; each plate's `parent` indexes into
    /// the vehicle list.
    pub fn detect(&mut self, frame: &Frame) -> (Vec<Region>, Vec<Region>) {
        let vehicles = match self.vehicle_backend.detect(
            &frame.pixels,
            frame.width,
            frame.height,
            RegionClass::Vehicle,
            self.settings.vehicle_confidence,
        ) {
            Ok(regions) => regions,
            Err(e) => {
                log::warn!(
                    "[{}] vehicle detector '{}' failed: {}",
                    frame.camera_id,
                    self.vehicle_backend.name(),
                    e
                );
                Vec::new()
            }
        };

        let mut plates = Vec::new();
        for (index, vehicle) in vehicles.iter().enumerate() {
            let Some((crop, crop_w, crop_h)) = crop_luma(frame, vehicle) else {
                continue;
            };
            let found = match self.plate_backend.detect(
                &crop,
                crop_w,
                crop_h,
                RegionClass::Plate,
                self.settings.plate_confidence,
            ) {
                Ok(regions) => regions,
                Err(e) => {
                    log::warn!(
                        "[{}] plate detector '{}' failed: {}",
                        frame.camera_id,
                        self.plate_backend.name(),
                        e
                    );
                    continue;
                }
            };
            for mut plate in found {
                // Translate crop coordinates back into the full frame.
                plate.bbox = plate.bbox.offset(vehicle.bbox.x1, vehicle.bbox.y1);
                plate.parent = Some(index);
                plates.push(plate);
            }
        }

        (vehicles, plates)
    }
}

/// Extract a vehicle crop from a luma frame. Returns `None` for empty or
/// out-of-bounds boxes.
fn crop_luma(frame: &Frame, region: &Region) -> Option<(Vec<u8>, u32, u32)> {
    let b = &region.bbox;
    let x2 = b.x2.min(frame.width);
    let y2 = b.y2.min(frame.height);
    if b.x1 >= x2 || b.y1 >= y2 {
        return None;
    }
    let (w, h) = (x2 - b.x1, y2 - b.y1);
    let mut crop = Vec::with_capacity((w * h) as usize);
    for row in b.y1..y2 {
        let start = (row * frame.width + b.x1) as usize;
        crop.extend_from_slice(&frame.pixels[start..start + w as usize]);
    }
    Some((crop, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BBox;

    fn frame(width: u32, height: u32) -> Frame {
        Frame {
            camera_id: "cam".to_string(),
            seq: 1,
            timestamp: 0,
            pixels: vec![128u8; (width * height) as usize],
            width,
            height,
            synthetic: false,
        }
    }

    fn settings() -> DetectSettings {
        DetectSettings {
            vehicle_confidence: 0.4,
            plate_confidence: 0.25,
        }
    }

    #[test]
    fn plate_boxes_are_translated_to_full_frame() {
        let vehicle = StubDetector::new().with_vehicle(BBox::new(100, 50, 300, 200), 0.9);
        let plate = StubDetector::new().with_plate(BBox::new(20, 30, 80, 60), 0.5);
        let mut detector =
            TwoStageDetector::new(Box::new(vehicle), Box::new(plate), settings());

        let (vehicles, plates) = detector.detect(&frame(640, 480));
        assert_eq!(vehicles.len(), 1);
        assert_eq!(plates.len(), 1);
        assert_eq!(plates[0].bbox, BBox::new(120, 80, 180, 110));
        assert_eq!(plates[0].parent, Some(0));
    }

    #[test]
    fn low_confidence_vehicle_suppresses_plate_search() {
        let vehicle = StubDetector::new().with_vehicle(BBox::new(0, 0, 100, 100), 0.2);
        let plate = StubDetector::new().with_plate(BBox::new(10, 10, 40, 30), 0.9);
        let mut detector =
            TwoStageDetector::new(Box::new(vehicle), Box::new(plate), settings());

        let (vehicles, plates) = detector.detect(&frame(640, 480));
        assert!(vehicles.is_empty());
        assert!(plates.is_empty());
    }

    #[test]
    fn plate_threshold_is_lower_than_vehicle_threshold() {
        // A 0.3-confidence plate passes while a 0.3-confidence vehicle
        // would not.
        let vehicle = StubDetector::new().with_vehicle(BBox::new(0, 0, 200, 200), 0.9);
        let plate = StubDetector::new().with_plate(BBox::new(10, 10, 60, 40), 0.3);
        let mut detector =
            TwoStageDetector::new(Box::new(vehicle), Box::new(plate), settings());

        let (_, plates) = detector.detect(&frame(640, 480));
        assert_eq!(plates.len(), 1);
    }
}
