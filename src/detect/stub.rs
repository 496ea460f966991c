use anyhow::Result;

use crate::detect::backend::{Detector, Region, RegionClass};
use crate::BBox;

/// Scripted detector for tests and synthetic runs.
///
/// Emits the configured vehicle boxes for full-frame vehicle queries and
/// the configured plate boxes (in crop coordinates) for plate queries.
pub struct StubDetector {
    pub vehicles: Vec<(BBox, f32)>,
    /// Plate boxes relative to whatever crop is handed in.
    pub plates: Vec<(BBox, f32)>,
}

impl StubDetector {
    pub fn new() -> Self {
        Self {
            vehicles: Vec::new(),
            plates: Vec::new(),
        }
    }

    pub fn with_vehicle(mut self, bbox: BBox, confidence: f32) -> Self {
        self.vehicles.push((bbox, confidence));
        self
    }

    pub fn with_plate(mut self, bbox: BBox, confidence: f32) -> Self {
        self.plates.push((bbox, confidence));
        self
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        class: RegionClass,
        min_confidence: f32,
    ) -> Result<Vec<Region>> {
        let scripted = match class {
            RegionClass::Vehicle => &self.vehicles,
            RegionClass::Plate => &self.plates,
        };
        Ok(scripted
            .iter()
            .filter(|(_, conf)| *conf >= min_confidence)
            .map(|&(bbox, confidence)| Region {
                bbox,
                confidence,
                class,
                parent: None,
            })
            .collect())
    }
}
