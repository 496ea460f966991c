use anyhow::Result;

use crate::BBox;

/// Region classes the pipeline cares about.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionClass {
    Vehicle,
    Plate,
}

/// A detected bounding box with class and confidence.
///
/// Regions are ephemeral: recomputed every frame, never persisted.
#[derive(Clone, Debug)]
pub struct Region {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: RegionClass,
    /// Index of the parent vehicle region, for plates found inside a
    /// vehicle crop.
    pub parent: Option<usize>,
}

/// Detector backend trait.
///
/// The actual model (YOLO, ONNX runtime, remote inference server) lives
/// behind this boundary; the pipeline only consumes regions. Backends
/// must treat the pixel slice as read-only and ephemeral.
pub trait Detector: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Run detection over an 8-bit luma buffer, returning regions of the
    /// requested class at or above `min_confidence`.
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        class: RegionClass,
        min_confidence: f32,
    ) -> Result<Vec<Region>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
