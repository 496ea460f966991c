//! Crop sharpness gating.
//!
//! A stable crop is only worth a recognition call if it is sharp enough
//! to read. The score is the variance of the 3x3 Laplacian response over
//! the luma crop; motion blur and defocus flatten the edge response and
//! drag the variance down.

use crate::config::QualitySettings;

/// Variance of the Laplacian edge response.
pub fn sharpness_score(pixels: &[u8], width: u32, height: u32) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }
    let w = width as usize;
    let h = height as usize;
    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = f64::from(pixels[y * w + x]);
            let neighbors = f64::from(pixels[(y - 1) * w + x])
                + f64::from(pixels[(y + 1) * w + x])
                + f64::from(pixels[y * w + x - 1])
                + f64::from(pixels[y * w + x + 1]);
            responses.push(neighbors - 4.0 * center);
        }
    }
    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

/// Sharpness gate applied to stable crops before enhancement.
pub struct QualityGate {
    settings: QualitySettings,
}

impl QualityGate {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings }
    }

    /// True when the crop is sharp enough to recognize.
    pub fn is_sharp_enough(&self, pixels: &[u8], width: u32, height: u32) -> bool {
        sharpness_score(pixels, width, height) >= self.settings.sharpness_threshold
    }
}
