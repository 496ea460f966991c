//! Deterministic crop enhancement for recognition.
//!
//! Fixed transform order: contrast stretch, median denoise, sharpen,
//! adaptive binarization. Pure function of the input crop with no learned
//! parameters, so identical crop bytes always produce identical output
//! bytes and recognition results stay reproducible under test.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage};

use crate::ingest::Frame;
use crate::BBox;

/// A luma crop with dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crop {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Extract a padded plate crop from a frame.
pub fn extract_crop(frame: &Frame, bbox: &BBox, padding: u32) -> Option<Crop> {
    let b = bbox.padded(padding, frame.width, frame.height);
    if b.width() == 0 || b.height() == 0 {
        return None;
    }
    let mut pixels = Vec::with_capacity((b.width() * b.height()) as usize);
    for row in b.y1..b.y2 {
        let start = (row * frame.width + b.x1) as usize;
        pixels.extend_from_slice(&frame.pixels[start..start + b.width() as usize]);
    }
    Some(Crop {
        pixels,
        width: b.width(),
        height: b.height(),
    })
}

/// Apply the full enhancement chain.
pub fn enhance(crop: &Crop) -> Crop {
    let stretched = contrast_stretch(&crop.pixels);
    let denoised = median3(&stretched, crop.width, crop.height);
    let sharpened = sharpen3(&denoised, crop.width, crop.height);
    let binary = adaptive_threshold(&sharpened, crop.width, crop.height, 11, 2);
    Crop {
        pixels: binary,
        width: crop.width,
        height: crop.height,
    }
}

/// Encode an enhanced crop as JPEG for the recognition engines.
pub fn encode_jpeg(crop: &Crop) -> Result<Vec<u8>> {
    let image = GrayImage::from_raw(crop.width, crop.height, crop.pixels.clone())
        .context("crop buffer does not match dimensions")?;
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, 90)
        .encode(
            image.as_raw(),
            crop.width,
            crop.height,
            ExtendedColorType::L8,
        )
        .context("encode crop jpeg")?;
    Ok(bytes)
}

/// Stretch the 2nd..98th percentile range across the full 0..255 span.
fn contrast_stretch(pixels: &[u8]) -> Vec<u8> {
    let mut histogram = [0u32; 256];
    for &p in pixels {
        histogram[p as usize] += 1;
    }
    let total = pixels.len() as u32;
    let clip = total / 50; // 2%
    let mut low = 0usize;
    let mut acc = 0u32;
    for (i, &count) in histogram.iter().enumerate() {
        acc += count;
        if acc > clip {
            low = i;
            break;
        }
    }
    let mut high = 255usize;
    acc = 0;
    for (i, &count) in histogram.iter().enumerate().rev() {
        acc += count;
        if acc > clip {
            high = i;
            break;
        }
    }
    if high <= low {
        return pixels.to_vec();
    }
    let span = (high - low) as f32;
    pixels
        .iter()
        .map(|&p| {
            let clamped = (p as usize).clamp(low, high);
            (((clamped - low) as f32 / span) * 255.0).round() as u8
        })
        .collect()
}

/// 3x3 median filter; borders are copied through.
fn median3(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if w < 3 || h < 3 {
        return pixels.to_vec();
    }
    let mut out = pixels.to_vec();
    let mut window = [0u8; 9];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut k = 0;
            for dy in 0..3 {
                for dx in 0..3 {
                    window[k] = pixels[(y + dy - 1) * w + (x + dx - 1)];
                    k += 1;
                }
            }
            window.sort_unstable();
            out[y * w + x] = window[4];
        }
    }
    out
}

/// 3x3 sharpen kernel (center 9, neighbors -1); borders copied through.
fn sharpen3(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if w < 3 || h < 3 {
        return pixels.to_vec();
    }
    let mut out = pixels.to_vec();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut sum = 9 * i32::from(pixels[y * w + x]);
            for (dy, dx) in [
                (0, 0),
                (0, 1),
                (0, 2),
                (1, 0),
                (1, 2),
                (2, 0),
                (2, 1),
                (2, 2),
            ] {
                sum -= i32::from(pixels[(y + dy - 1) * w + (x + dx - 1)]);
            }
            out[y * w + x] = sum.clamp(0, 255) as u8;
        }
    }
    out
}

/// Adaptive mean threshold: a pixel is foreground when it exceeds the
/// local window mean minus `offset`.
fn adaptive_threshold(pixels: &[u8], width: u32, height: u32, window: usize, offset: i32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let radius = window / 2;
    let mut out = vec![0u8; pixels.len()];
    for y in 0..h {
        for x in 0..w {
            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius + 1).min(h);
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(w);
            let mut sum = 0u32;
            for row in y0..y1 {
                for col in x0..x1 {
                    sum += u32::from(pixels[row * w + col]);
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as u32;
            let mean = (sum / count) as i32;
            out[y * w + x] = if i32::from(pixels[y * w + x]) > mean - offset {
                255
            } else {
                0
            };
        }
    }
    out
}
