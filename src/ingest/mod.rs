//! Frame ingestion.
//!
//! One `FrameSource` per camera, producing a lazy, infinite sequence of
//! timestamped luma frames. Sources are responsible for:
//! - Connecting to MJPEG-over-HTTP camera streams
//! - Reconnecting with capped exponential backoff on stream errors
//! - Degrading to a synthetic generator after repeated failures so the
//!   downstream pipeline never stalls on a dead camera
//! - Frame-rate decimation to the configured target fps
//!
//! Synthetic frames are tagged so detection is skipped for ghost data.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use crate::now_s;

const MAX_JPEG_BYTES: usize = 4 * 1024 * 1024;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A single timestamped camera frame (8-bit luma).
#[derive(Clone, Debug)]
pub struct Frame {
    pub camera_id: String,
    pub seq: u64,
    /// Capture time, seconds since epoch.
    pub timestamp: u64,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// True when produced by the degraded-mode generator rather than a
    /// live camera. Synthetic frames must never yield real detections.
    pub synthetic: bool,
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub camera_id: String,
    /// `http(s)://...` for MJPEG streams, `stub://...` for synthetic.
    pub url: String,
    pub target_fps: u32,
    /// Dimensions used by the synthetic generator.
    pub width: u32,
    pub height: u32,
    /// Consecutive failures tolerated before degrading to synthetic.
    pub max_failures: u32,
    /// Initial reconnect backoff; doubles up to a 30s cap.
    pub backoff_base: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            camera_id: "camera".to_string(),
            url: "stub://camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            max_failures: 5,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Connected,
    Degraded,
}

/// Per-camera frame source with reconnect and synthetic fallback.
pub struct FrameSource {
    config: SourceConfig,
    live: Option<MjpegHttpSource>,
    synthetic: SyntheticSource,
    state: SourceState,
    consecutive_failures: u32,
    backoff: Duration,
    /// Bumped on every successful (re)connect; lets the pipeline reset
    /// per-camera state such as the motion background model.
    generation: u64,
    seq: u64,
}

impl FrameSource {
    pub fn new(config: SourceConfig) -> Self {
        let synthetic = SyntheticSource::new(config.clone());
        let backoff = config.backoff_base;
        Self {
            config,
            live: None,
            synthetic,
            state: SourceState::Degraded,
            consecutive_failures: 0,
            backoff,
            generation: 0,
            seq: 0,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frames_captured(&self) -> u64 {
        self.seq
    }

    /// Establish the initial connection. Synthetic (`stub://`) URLs are
    /// always considered connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.config.url.starts_with("stub://") {
            self.state = SourceState::Connected;
            self.generation += 1;
            log::info!(
                "[{}] connected to {} (synthetic stream)",
                self.config.camera_id,
                self.config.url
            );
            return Ok(());
        }
        match MjpegHttpSource::connect(&self.config) {
            Ok(source) => {
                self.live = Some(source);
                self.state = SourceState::Connected;
                self.consecutive_failures = 0;
                self.backoff = self.config.backoff_base;
                self.generation += 1;
                log::info!(
                    "[{}] connected to {}",
                    self.config.camera_id,
                    self.config.url
                );
                Ok(())
            }
            Err(e) => {
                self.live = None;
                Err(e)
            }
        }
    }

    /// Produce the next frame, blocking until one is available.
    ///
    /// Connection errors are absorbed here: the source retries with
    /// backoff and, once `max_failures` consecutive attempts have failed,
    /// serves synthetic frames instead of erroring. Degraded mode keeps
    /// probing the camera and switches back when it recovers.
    pub fn next_frame(&mut self) -> Frame {
        loop {
            if self.config.url.starts_with("stub://") {
                let generated = self.synthetic.generate();
                return self.emit(generated, false);
            }
            if self.state == SourceState::Degraded {
                if self.try_recover() {
                    continue;
                }
                let generated = self.synthetic.generate();
                return self.emit(generated, true);
            }

            let result = match self.live.as_mut() {
                Some(live) => live.next_jpeg_frame(),
                None => Err(anyhow!("not connected")),
            };
            match result.and_then(|jpeg| decode_luma(&jpeg)) {
                Ok((pixels, width, height)) => {
                    self.consecutive_failures = 0;
                    self.backoff = self.config.backoff_base;
                    return self.emit((pixels, width, height), false);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    log::warn!(
                        "[{}] stream error ({} consecutive): {}",
                        self.config.camera_id,
                        self.consecutive_failures,
                        e
                    );
                    self.live = None;
                    if self.consecutive_failures >= self.config.max_failures {
                        log::error!(
                            "[{}] {} consecutive failures; degrading to synthetic frames",
                            self.config.camera_id,
                            self.consecutive_failures
                        );
                        self.state = SourceState::Degraded;
                        continue;
                    }
                    std::thread::sleep(self.backoff);
                    self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                    if let Err(e) = self.connect() {
                        log::warn!("[{}] reconnect failed: {}", self.config.camera_id, e);
                    }
                }
            }
        }
    }

    /// One reconnect probe per degraded-mode backoff window.
    fn try_recover(&mut self) -> bool {
        if self.synthetic.frames_since_probe < self.probe_every_frames() {
            self.synthetic.frames_since_probe += 1;
            return false;
        }
        self.synthetic.frames_since_probe = 0;
        match self.connect() {
            Ok(()) => {
                log::info!("[{}] camera recovered from degraded mode", self.config.camera_id);
                self.consecutive_failures = 0;
                true
            }
            Err(_) => false,
        }
    }

    fn probe_every_frames(&self) -> u32 {
        // Roughly one probe per 30s of synthetic output.
        self.config.target_fps.max(1) * 30
    }

    fn emit(&mut self, (pixels, width, height): (Vec<u8>, u32, u32), synthetic: bool) -> Frame {
        self.seq += 1;
        Frame {
            camera_id: self.config.camera_id.clone(),
            seq: self.seq,
            timestamp: now_s().unwrap_or(0),
            pixels,
            width,
            height,
            synthetic,
        }
    }
}

// ----------------------------------------------------------------------------
// MJPEG-over-HTTP backend
// ----------------------------------------------------------------------------

struct MjpegHttpSource {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    last_frame_at: Option<Instant>,
    min_interval: Duration,
}

impl MjpegHttpSource {
    fn connect(config: &SourceConfig) -> Result<Self> {
        let response = ureq::get(&config.url)
            .timeout(Duration::from_secs(10))
            .call()
            .with_context(|| format!("connect to camera stream {}", config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if !content_type.to_lowercase().contains("multipart") {
            return Err(anyhow!(
                "camera stream {} is not multipart mjpeg (Content-Type: {})",
                config.url,
                content_type
            ));
        }
        Ok(Self {
            reader: response.into_reader(),
            buffer: Vec::with_capacity(64 * 1024),
            last_frame_at: None,
            min_interval: frame_interval(config.target_fps),
        })
    }

    /// Read the next complete JPEG from the multipart stream, decimating
    /// to the target frame rate.
    fn next_jpeg_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);

                let now = Instant::now();
                if let Some(last) = self.last_frame_at {
                    if now.duration_since(last) < self.min_interval {
                        continue;
                    }
                }
                self.last_frame_at = Some(now);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic generator (stub:// and degraded mode)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    frames_since_probe: u32,
}

impl SyntheticSource {
    fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            frames_since_probe: 0,
        }
    }

    fn generate(&mut self) -> (Vec<u8>, u32, u32) {
        self.frame_count += 1;
        let pixel_count = (self.config.width * self.config.height) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        (pixels, self.config.width, self.config.height)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn decode_luma(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg frame")?;
    let luma = image.into_luma8();
    let (width, height) = luma.dimensions();
    Ok((luma.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut start = None;
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == 0xFF && buffer[i + 1] == 0xD8 {
            start = Some(i);
            break;
        }
        i += 1;
    }
    let start = start?;
    let mut j = start + 2;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF && buffer[j + 1] == 0xD9 {
            return Some((start, j + 2));
        }
        j += 1;
    }
    None
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> SourceConfig {
        SourceConfig {
            camera_id: "cam-test".to_string(),
            url: "stub://cam-test".to_string(),
            width: 320,
            height: 240,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn stub_source_produces_frames() -> Result<()> {
        let mut source = FrameSource::new(stub_config());
        source.connect()?;

        let frame = source.next_frame();
        assert_eq!(frame.width, 320);
        assert_eq!(frame.height, 240);
        assert_eq!(frame.pixels.len(), 320 * 240);
        assert!(!frame.synthetic);
        assert_eq!(frame.seq, 1);
        Ok(())
    }

    #[test]
    fn unreachable_camera_degrades_to_synthetic() {
        let config = SourceConfig {
            camera_id: "cam-down".to_string(),
            // Reserved port; connections are refused immediately.
            url: "http://127.0.0.1:9/stream".to_string(),
            max_failures: 2,
            backoff_base: Duration::from_millis(5),
            ..stub_config()
        };
        let mut source = FrameSource::new(config);
        // Initial connect fails but must not panic the worker.
        assert!(source.connect().is_err());

        let frame = source.next_frame();
        assert!(frame.synthetic, "degraded source must tag frames synthetic");
        assert_eq!(source.state(), SourceState::Degraded);

        // Degraded mode keeps producing without erroring.
        let frame = source.next_frame();
        assert!(frame.synthetic);
        assert_eq!(frame.seq, 2);
    }

    #[test]
    fn jpeg_bounds_found_in_noise() {
        let mut buf = vec![0x00, 0x11];
        buf.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
        buf.extend_from_slice(&[0x22]);
        assert_eq!(find_jpeg_bounds(&buf), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }
}
