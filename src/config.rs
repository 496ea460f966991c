//! Daemon configuration.
//!
//! Settings come from an optional TOML file, overridden by environment
//! variables, and are validated once at startup. Invalid thresholds or an
//! empty camera list abort the process; nothing is re-validated per frame.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::dedup::DedupScope;
use crate::recognize::RecognitionPolicy;

const DEFAULT_DB_PATH: &str = "platewatch.db";
const DEFAULT_IMAGE_DIR: &str = "captures";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;

// Motion defaults, tuned so a long-stationary vehicle is absorbed into
// the background instead of being flagged forever.
const DEFAULT_MOTION_ALPHA: f32 = 0.02;
const DEFAULT_MOTION_DIFF: u8 = 25;
const DEFAULT_MOTION_MIN_AREA: u32 = 15_000;
const DEFAULT_MOTION_RESEED_FRAMES: u32 = 10;

const DEFAULT_VEHICLE_CONFIDENCE: f32 = 0.4;
const DEFAULT_PLATE_CONFIDENCE: f32 = 0.25;

const DEFAULT_BUFFER_LEN: usize = 5;
const DEFAULT_STABLE_FRAMES: u32 = 3;
const DEFAULT_VARIANCE_THRESHOLD: f32 = 15.0;
const DEFAULT_MATCH_IOU: f32 = 0.3;
const DEFAULT_MISS_TIMEOUT: u32 = 10;
const DEFAULT_RECAPTURE_COOLDOWN_S: u64 = 30;

const DEFAULT_SHARPNESS_THRESHOLD: f64 = 100.0;
const DEFAULT_CROP_PADDING: u32 = 15;

const DEFAULT_FAST_ENGINE_URL: &str = "http://localhost:11434";
const DEFAULT_FAST_MODEL: &str = "qwen2.5vl:3b";
const DEFAULT_ACCURATE_ENGINE_URL: &str = "http://localhost:8080";
const DEFAULT_ENGINE_TIMEOUT_S: u64 = 15;
const DEFAULT_FALLBACK_CONFIDENCE: f32 = 0.6;

const DEFAULT_DEDUP_COOLDOWN_S: u64 = 180;
const DEFAULT_SYNC_INTERVAL_S: u64 = 60;
const DEFAULT_CLEANUP_GRACE_S: u64 = 20 * 60;
const DEFAULT_QUEUE_CAPACITY: usize = 16;

// -------------------- raw file shape --------------------

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    db_path: Option<String>,
    image_dir: Option<String>,
    #[serde(default)]
    camera: Vec<CameraFile>,
    motion: Option<MotionFile>,
    detect: Option<DetectFile>,
    stability: Option<StabilityFile>,
    quality: Option<QualityFile>,
    recognition: Option<RecognitionFile>,
    dedup: Option<DedupFile>,
    sync: Option<SyncFile>,
}

#[derive(Debug, Deserialize)]
struct CameraFile {
    id: String,
    url: String,
    direction: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionFile {
    learning_rate: Option<f32>,
    diff_threshold: Option<u8>,
    min_area: Option<u32>,
    reseed_after_static_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectFile {
    vehicle_confidence: Option<f32>,
    plate_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StabilityFile {
    buffer_len: Option<usize>,
    required_stable_frames: Option<u32>,
    variance_threshold: Option<f32>,
    match_iou: Option<f32>,
    miss_timeout: Option<u32>,
    recapture_cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct QualityFile {
    sharpness_threshold: Option<f64>,
    crop_padding: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionFile {
    policy: Option<String>,
    fast_engine_url: Option<String>,
    fast_model: Option<String>,
    accurate_engine_url: Option<String>,
    engine_timeout_secs: Option<u64>,
    fallback_confidence: Option<f32>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DedupFile {
    cooldown_secs: Option<u64>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncFile {
    remote_url: Option<String>,
    remote_token: Option<String>,
    interval_secs: Option<u64>,
    cleanup_grace_secs: Option<u64>,
}

// -------------------- validated settings --------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub image_dir: String,
    pub cameras: Vec<CameraSettings>,
    pub motion: MotionSettings,
    pub detect: DetectSettings,
    pub stability: StabilitySettings,
    pub quality: QualitySettings,
    pub recognition: RecognitionSettings,
    pub dedup: DedupSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub id: String,
    pub url: String,
    /// Optional gate direction tag ("IN"/"OUT") carried into detections.
    pub direction: Option<String>,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MotionSettings {
    pub learning_rate: f32,
    pub diff_threshold: u8,
    pub min_area: u32,
    pub reseed_after_static_frames: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectSettings {
    pub vehicle_confidence: f32,
    pub plate_confidence: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct StabilitySettings {
    pub buffer_len: usize,
    pub required_stable_frames: u32,
    pub variance_threshold: f32,
    pub match_iou: f32,
    pub miss_timeout: u32,
    pub recapture_cooldown: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    pub sharpness_threshold: f64,
    pub crop_padding: u32,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub policy: RecognitionPolicy,
    pub fast_engine_url: String,
    pub fast_model: String,
    pub accurate_engine_url: String,
    pub engine_timeout: Duration,
    pub fallback_confidence: f32,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub cooldown: Duration,
    pub scope: DedupScope,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Remote store endpoint; `None` disables sync (cleanup then runs on
    /// the grace period alone).
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub interval: Duration,
    pub cleanup_grace: Duration,
}

impl Config {
    /// Load from `PLATEWATCH_CONFIG` (or the given path), apply env
    /// overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("PLATEWATCH_CONFIG").ok();
        let file_cfg = match path.or_else(|| env_path.as_deref().map(Path::new)) {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let motion = file.motion.unwrap_or_default();
        let detect = file.detect.unwrap_or_default();
        let stability = file.stability.unwrap_or_default();
        let quality = file.quality.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let dedup = file.dedup.unwrap_or_default();
        let sync = file.sync.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            image_dir: file
                .image_dir
                .unwrap_or_else(|| DEFAULT_IMAGE_DIR.to_string()),
            cameras: file
                .camera
                .into_iter()
                .map(|cam| CameraSettings {
                    id: cam.id,
                    url: cam.url,
                    direction: cam.direction,
                    target_fps: cam.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                    width: cam.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                    height: cam.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                })
                .collect(),
            motion: MotionSettings {
                learning_rate: motion.learning_rate.unwrap_or(DEFAULT_MOTION_ALPHA),
                diff_threshold: motion.diff_threshold.unwrap_or(DEFAULT_MOTION_DIFF),
                min_area: motion.min_area.unwrap_or(DEFAULT_MOTION_MIN_AREA),
                reseed_after_static_frames: motion
                    .reseed_after_static_frames
                    .unwrap_or(DEFAULT_MOTION_RESEED_FRAMES),
            },
            detect: DetectSettings {
                vehicle_confidence: detect
                    .vehicle_confidence
                    .unwrap_or(DEFAULT_VEHICLE_CONFIDENCE),
                plate_confidence: detect.plate_confidence.unwrap_or(DEFAULT_PLATE_CONFIDENCE),
            },
            stability: StabilitySettings {
                buffer_len: stability.buffer_len.unwrap_or(DEFAULT_BUFFER_LEN),
                required_stable_frames: stability
                    .required_stable_frames
                    .unwrap_or(DEFAULT_STABLE_FRAMES),
                variance_threshold: stability
                    .variance_threshold
                    .unwrap_or(DEFAULT_VARIANCE_THRESHOLD),
                match_iou: stability.match_iou.unwrap_or(DEFAULT_MATCH_IOU),
                miss_timeout: stability.miss_timeout.unwrap_or(DEFAULT_MISS_TIMEOUT),
                recapture_cooldown: Duration::from_secs(
                    stability
                        .recapture_cooldown_secs
                        .unwrap_or(DEFAULT_RECAPTURE_COOLDOWN_S),
                ),
            },
            quality: QualitySettings {
                sharpness_threshold: quality
                    .sharpness_threshold
                    .unwrap_or(DEFAULT_SHARPNESS_THRESHOLD),
                crop_padding: quality.crop_padding.unwrap_or(DEFAULT_CROP_PADDING),
            },
            recognition: RecognitionSettings {
                policy: recognition
                    .policy
                    .as_deref()
                    .and_then(RecognitionPolicy::parse)
                    .unwrap_or(RecognitionPolicy::Fallback),
                fast_engine_url: recognition
                    .fast_engine_url
                    .unwrap_or_else(|| DEFAULT_FAST_ENGINE_URL.to_string()),
                fast_model: recognition
                    .fast_model
                    .unwrap_or_else(|| DEFAULT_FAST_MODEL.to_string()),
                accurate_engine_url: recognition
                    .accurate_engine_url
                    .unwrap_or_else(|| DEFAULT_ACCURATE_ENGINE_URL.to_string()),
                engine_timeout: Duration::from_secs(
                    recognition
                        .engine_timeout_secs
                        .unwrap_or(DEFAULT_ENGINE_TIMEOUT_S),
                ),
                fallback_confidence: recognition
                    .fallback_confidence
                    .unwrap_or(DEFAULT_FALLBACK_CONFIDENCE),
                queue_capacity: recognition.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            },
            dedup: DedupSettings {
                cooldown: Duration::from_secs(
                    dedup.cooldown_secs.unwrap_or(DEFAULT_DEDUP_COOLDOWN_S),
                ),
                scope: dedup
                    .scope
                    .as_deref()
                    .and_then(DedupScope::parse)
                    .unwrap_or(DedupScope::PerCamera),
            },
            sync: SyncSettings {
                remote_url: sync.remote_url.filter(|url| !url.trim().is_empty()),
                remote_token: sync.remote_token,
                interval: Duration::from_secs(
                    sync.interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_S),
                ),
                cleanup_grace: Duration::from_secs(
                    sync.cleanup_grace_secs.unwrap_or(DEFAULT_CLEANUP_GRACE_S),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PLATEWATCH_DB") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("PLATEWATCH_IMAGE_DIR") {
            if !dir.trim().is_empty() {
                self.image_dir = dir;
            }
        }
        if let Ok(url) = std::env::var("PLATEWATCH_FAST_ENGINE_URL") {
            if !url.trim().is_empty() {
                self.recognition.fast_engine_url = url;
            }
        }
        if let Ok(url) = std::env::var("PLATEWATCH_REMOTE_URL") {
            if !url.trim().is_empty() {
                self.sync.remote_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("PLATEWATCH_REMOTE_TOKEN") {
            if !token.trim().is_empty() {
                self.sync.remote_token = Some(token);
            }
        }
        if let Ok(secs) = std::env::var("PLATEWATCH_DEDUP_COOLDOWN_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("PLATEWATCH_DEDUP_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.dedup.cooldown = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one [[camera]] must be configured"));
        }
        for cam in &self.cameras {
            if cam.id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if cam.target_fps == 0 {
                return Err(anyhow!("camera '{}': target_fps must be > 0", cam.id));
            }
        }
        let ids: std::collections::HashSet<_> =
            self.cameras.iter().map(|cam| cam.id.as_str()).collect();
        if ids.len() != self.cameras.len() {
            return Err(anyhow!("camera ids must be unique"));
        }
        if !(0.0..=1.0).contains(&self.motion.learning_rate) {
            return Err(anyhow!("motion.learning_rate must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.detect.vehicle_confidence)
            || !(0.0..=1.0).contains(&self.detect.plate_confidence)
        {
            return Err(anyhow!("detection confidence thresholds must be within 0..=1"));
        }
        if self.stability.buffer_len == 0 {
            return Err(anyhow!("stability.buffer_len must be > 0"));
        }
        if self.stability.required_stable_frames == 0 {
            return Err(anyhow!("stability.required_stable_frames must be > 0"));
        }
        if self.stability.variance_threshold <= 0.0 {
            return Err(anyhow!("stability.variance_threshold must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.stability.match_iou) {
            return Err(anyhow!("stability.match_iou must be within 0..=1"));
        }
        if self.quality.sharpness_threshold < 0.0 {
            return Err(anyhow!("quality.sharpness_threshold must be >= 0"));
        }
        if self.recognition.queue_capacity == 0 {
            return Err(anyhow!("recognition.queue_capacity must be > 0"));
        }
        if self.dedup.cooldown.as_secs() == 0 {
            return Err(anyhow!("dedup.cooldown_secs must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg: ConfigFile = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
