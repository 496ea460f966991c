//! Worker wiring.
//!
//! One `CameraWorker` thread per configured camera owns that camera's
//! frame source, motion gate, detector and tracker; stable, sharp crops
//! are pushed onto a bounded `CaptureQueue`. A shared recognition worker
//! pops the queue and runs dispatch, validation, dedup and persistence.
//! The queue drops its oldest entry under pressure: stalling a capture
//! loop behind a slow recognition engine is never acceptable.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{CameraSettings, Config};
use crate::dedup::Deduplicator;
use crate::detect::TwoStageDetector;
use crate::enhance::{self, Crop};
use crate::ingest::{Frame, FrameSource, SourceConfig};
use crate::motion::MotionGate;
use crate::plate::PlateValidator;
use crate::quality::QualityGate;
use crate::recognize::Dispatcher;
use crate::store::{DetectionRecord, ImageCleanup, PersistenceCoordinator, RemoteSync};
use crate::track::StabilityTracker;
use crate::now_s;

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// A stable, sharp, enhanced crop waiting for recognition.
pub struct CaptureJob {
    pub camera_id: String,
    pub direction: Option<String>,
    pub track_id: u64,
    pub timestamp: u64,
    pub detect_confidence: f32,
    /// Enhanced plate crop, JPEG-encoded for the engines.
    pub roi_jpeg: Vec<u8>,
    /// Full-frame context image.
    pub full_jpeg: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Bounded capture queue
// ----------------------------------------------------------------------------

/// MPSC queue between camera workers and the recognition worker. Bounded;
/// push never blocks, the oldest pending job is evicted instead.
pub struct CaptureQueue {
    inner: Mutex<VecDeque<CaptureJob>>,
    ready: Condvar,
    capacity: usize,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, job: CaptureJob) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                log::warn!(
                    "capture queue full; dropping oldest capture ({} track {})",
                    dropped.camera_id,
                    dropped.track_id
                );
            }
        }
        queue.push_back(job);
        self.ready.notify_one();
    }

    /// Pop the next job, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<CaptureJob> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        while queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self
                .ready
                .wait_timeout(queue, remaining)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Camera worker
// ----------------------------------------------------------------------------

/// Per-camera capture loop: ingest, motion gate, detect, track, quality
/// gate, enhance, enqueue.
pub struct CameraWorker {
    camera: CameraSettings,
    source: FrameSource,
    gate: MotionGate,
    tracker: StabilityTracker,
    detector: TwoStageDetector,
    quality: QualityGate,
    crop_padding: u32,
    queue: Arc<CaptureQueue>,
}

impl CameraWorker {
    pub fn new(
        camera: CameraSettings,
        config: &Config,
        detector: TwoStageDetector,
        queue: Arc<CaptureQueue>,
    ) -> Self {
        let source = FrameSource::new(SourceConfig {
            camera_id: camera.id.clone(),
            url: camera.url.clone(),
            target_fps: camera.target_fps,
            width: camera.width,
            height: camera.height,
            ..SourceConfig::default()
        });
        Self {
            source,
            gate: MotionGate::new(config.motion),
            tracker: StabilityTracker::new(config.stability),
            detector,
            quality: QualityGate::new(config.quality),
            crop_padding: config.quality.crop_padding,
            queue,
            camera,
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        if let Err(e) = self.source.connect() {
            log::warn!("[{}] initial connect failed: {:#}", self.camera.id, e);
        }
        let mut generation = self.source.generation();
        let pace = Duration::from_millis(1000 / u64::from(self.camera.target_fps.max(1)));

        while !shutdown.load(Ordering::Relaxed) {
            let frame = self.source.next_frame();
            if self.source.generation() != generation {
                // Reconnected: the scene may have changed arbitrarily.
                generation = self.source.generation();
                self.gate.reset();
                self.tracker.clear();
            }
            self.process_frame(&frame);

            // Live streams pace themselves over the network; synthetic
            // and stub output needs explicit pacing.
            if frame.synthetic || self.camera.url.starts_with("stub://") {
                std::thread::sleep(pace);
            }
        }
        self.tracker.clear();
        log::info!("[{}] camera worker stopped", self.camera.id);
    }

    /// Run the capture stages on one frame.
    pub fn process_frame(&mut self, frame: &Frame) {
        // Ghost data from a degraded source: keep-alive only.
        if frame.synthetic {
            return;
        }

        if !self.gate.classify(frame).is_motion {
            // Still age the tracks so a vanished plate expires.
            self.tracker.observe(frame.timestamp, &[]);
            return;
        }

        let (_vehicles, plates) = self.detector.detect(frame);
        for capture in self.tracker.observe(frame.timestamp, &plates) {
            let Some(crop) = enhance::extract_crop(frame, &capture.bbox, self.crop_padding) else {
                continue;
            };
            if !self.quality.is_sharp_enough(&crop.pixels, crop.width, crop.height) {
                log::debug!(
                    "[{}] capture for track {} too blurry; reopening",
                    frame.camera_id,
                    capture.track_id
                );
                self.tracker.reopen(capture.track_id);
                continue;
            }

            let enhanced = enhance::enhance(&crop);
            let job = match self.build_job(frame, &capture, &enhanced) {
                Ok(job) => job,
                Err(e) => {
                    log::warn!("[{}] failed to encode capture: {:#}", frame.camera_id, e);
                    continue;
                }
            };
            self.queue.push(job);
        }
    }

    fn build_job(
        &self,
        frame: &Frame,
        capture: &crate::track::CaptureCandidate,
        enhanced: &Crop,
    ) -> Result<CaptureJob> {
        let full = Crop {
            pixels: frame.pixels.clone(),
            width: frame.width,
            height: frame.height,
        };
        Ok(CaptureJob {
            camera_id: frame.camera_id.clone(),
            direction: self.camera.direction.clone(),
            track_id: capture.track_id,
            timestamp: capture.timestamp,
            detect_confidence: capture.confidence,
            roi_jpeg: enhance::encode_jpeg(enhanced)?,
            full_jpeg: enhance::encode_jpeg(&full)?,
        })
    }
}

// ----------------------------------------------------------------------------
// Recognition worker
// ----------------------------------------------------------------------------

/// Pops the capture queue and runs dispatch, validation, dedup and
/// persistence. Shared across all cameras.
pub struct RecognitionWorker {
    queue: Arc<CaptureQueue>,
    dispatcher: Dispatcher,
    dedup: Arc<Deduplicator>,
    coordinator: Arc<PersistenceCoordinator>,
    image_dir: PathBuf,
}

impl RecognitionWorker {
    pub fn new(
        queue: Arc<CaptureQueue>,
        dispatcher: Dispatcher,
        dedup: Arc<Deduplicator>,
        coordinator: Arc<PersistenceCoordinator>,
        image_dir: PathBuf,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            dedup,
            coordinator,
            image_dir,
        }
    }

    pub fn run(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if let Some(job) = self.queue.pop_timeout(SHUTDOWN_POLL) {
                self.handle(job);
            }
        }
        // Drain what is already queued before exiting.
        while let Some(job) = self.queue.pop_timeout(Duration::from_millis(0)) {
            self.handle(job);
        }
        log::info!("recognition worker stopped");
    }

    /// Full recognition path for one capture.
    pub fn handle(&self, job: CaptureJob) {
        let started = Instant::now();
        let Some(recognition) = self.dispatcher.recognize(&job.roi_jpeg) else {
            log::debug!(
                "[{}] no engine produced a reading for track {}",
                job.camera_id,
                job.track_id
            );
            return;
        };

        let Some(valid) = PlateValidator::validate(&recognition.text) else {
            log::debug!(
                "[{}] reading '{}' failed grammar validation",
                job.camera_id,
                recognition.text
            );
            return;
        };

        let now = now_s().unwrap_or(job.timestamp);
        if !self
            .dedup
            .accept(&job.camera_id, job.direction.as_deref(), &valid.text, now)
        {
            return;
        }

        let (full_image_path, roi_image_path) = self.write_images(&job);
        let record = DetectionRecord {
            id: None,
            plate: valid.text,
            vehicle_type: valid.vehicle_type,
            confidence: recognition.confidence,
            camera_id: job.camera_id,
            direction: job.direction,
            created_at: now,
            full_image_path,
            roi_image_path,
            engine: recognition.engine.to_string(),
            processing_ms: started.elapsed().as_millis() as u64,
            synced: false,
        };
        if let Err(e) = self.coordinator.record(&record) {
            log::error!("failed to persist detection {}: {:#}", record.plate, e);
        }
    }

    /// Write the context and ROI images. Image loss is tolerable; the
    /// detection row is not.
    fn write_images(&self, job: &CaptureJob) -> (Option<String>, Option<String>) {
        let full = self.write_image(job, "full", &job.full_jpeg);
        let roi = self.write_image(job, "roi", &job.roi_jpeg);
        (full, roi)
    }

    fn write_image(&self, job: &CaptureJob, kind: &str, bytes: &[u8]) -> Option<String> {
        let name = format!("{}_{}_{}_{}.jpg", job.camera_id, job.timestamp, job.track_id, kind);
        let path = self.image_dir.join(name);
        match write_file(&path, bytes) {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                log::warn!("could not write {} image {}: {:#}", kind, path.display(), e);
                None
            }
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create image dir {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Daemon assembly
// ----------------------------------------------------------------------------

/// All running threads of the daemon plus the shared shutdown flag.
pub struct Pipeline {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn camera workers, the recognition worker and the background
    /// sync/cleanup threads. `detector_factory` builds one detector per
    /// camera (backends are not shareable across threads).
    pub fn start(
        config: &Config,
        coordinator: Arc<PersistenceCoordinator>,
        detector_factory: impl Fn(&CameraSettings) -> TwoStageDetector,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(CaptureQueue::new(config.recognition.queue_capacity));
        let dedup = Arc::new(Deduplicator::new(
            config.dedup.cooldown,
            config.dedup.scope,
        ));
        let mut handles = Vec::new();

        for camera in &config.cameras {
            let mut worker = CameraWorker::new(
                camera.clone(),
                config,
                detector_factory(camera),
                Arc::clone(&queue),
            );
            let flag = Arc::clone(&shutdown);
            let name = format!("camera-{}", camera.id);
            handles.push(
                std::thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker.run(&flag))
                    .with_context(|| format!("spawn {}", name))?,
            );
        }

        let recognizer = RecognitionWorker::new(
            Arc::clone(&queue),
            Dispatcher::from_settings(&config.recognition),
            dedup,
            Arc::clone(&coordinator),
            PathBuf::from(&config.image_dir),
        );
        let flag = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name("recognition".to_string())
                .spawn(move || recognizer.run(&flag))
                .context("spawn recognition worker")?,
        );

        if let Some(remote) = RemoteSync::from_settings(&config.sync) {
            let store = coordinator.store();
            let flag = Arc::clone(&shutdown);
            let interval = config.sync.interval;
            handles.push(
                std::thread::Builder::new()
                    .name("remote-sync".to_string())
                    .spawn(move || {
                        run_periodic(&flag, interval, || {
                            let mut guard = store.lock().unwrap_or_else(|e| e.into_inner());
                            if let Err(e) = remote.run_once(&mut *guard) {
                                log::warn!("sync pass failed: {:#}", e);
                            }
                        });
                        log::info!("sync thread stopped");
                    })
                    .context("spawn sync thread")?,
            );
        }

        let cleanup = ImageCleanup::new(config.sync.cleanup_grace);
        let store = coordinator.store();
        let flag = Arc::clone(&shutdown);
        let interval = config.sync.interval;
        handles.push(
            std::thread::Builder::new()
                .name("image-cleanup".to_string())
                .spawn(move || {
                    run_periodic(&flag, interval, || {
                        let now = now_s().unwrap_or(0);
                        let mut guard = store.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(e) = cleanup.sweep(&mut *guard, now) {
                            log::warn!("cleanup sweep failed: {:#}", e);
                        }
                    });
                    log::info!("cleanup thread stopped");
                })
                .context("spawn cleanup thread")?,
        );

        Ok(Self { shutdown, handles })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Signal shutdown and join every worker.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if let Err(e) = handle.join() {
                log::error!("worker thread panicked: {:?}", e);
            }
        }
    }
}

/// Run `tick` every `interval`, polling the shutdown flag between sleeps.
fn run_periodic(shutdown: &AtomicBool, interval: Duration, mut tick: impl FnMut()) {
    let mut next = Instant::now() + interval;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_POLL.min(interval));
        if Instant::now() >= next {
            tick();
            next = Instant::now() + interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionSettings;
    use crate::detect::StubDetector;
    use crate::recognize::{EngineReading, RecognitionEngine, RecognitionPolicy};
    use crate::store::{DetectionStore, LogNotifier, MemoryDetectionStore};
    use crate::BBox;
    use anyhow::Result;

    fn test_config() -> Config {
        let file = {
            use std::io::Write;
            let mut f = tempfile::NamedTempFile::new().expect("temp config");
            f.write_all(
                br#"
                [[camera]]
                id = "cam1"
                url = "stub://cam1"
                direction = "IN"
                "#,
            )
            .expect("write config");
            f
        };
        let mut cfg = Config::load(Some(file.path())).expect("valid config");
        // Every frame counts as motion so detection always runs.
        cfg.motion = MotionSettings {
            min_area: 0,
            ..cfg.motion
        };
        cfg
    }

    /// Checkerboard frame: sharp everywhere, so the quality gate passes.
    fn sharp_frame(seq: u64, timestamp: u64) -> Frame {
        let (width, height) = (320u32, 240u32);
        let pixels = (0..width * height)
            .map(|i| {
                let (x, y) = (i % width, i / width);
                if (x + y) % 2 == 0 {
                    255
                } else {
                    0
                }
            })
            .collect();
        Frame {
            camera_id: "cam1".to_string(),
            seq,
            timestamp,
            pixels,
            width,
            height,
            synthetic: false,
        }
    }

    fn plate_detector() -> TwoStageDetector {
        let vehicle = StubDetector::new().with_vehicle(BBox::new(40, 40, 280, 200), 0.9);
        let plate = StubDetector::new().with_plate(BBox::new(60, 80, 180, 120), 0.8);
        TwoStageDetector::new(Box::new(vehicle), Box::new(plate), test_config().detect)
    }

    fn worker(config: &Config, queue: Arc<CaptureQueue>) -> CameraWorker {
        CameraWorker::new(config.cameras[0].clone(), config, plate_detector(), queue)
    }

    #[test]
    fn stable_plate_yields_exactly_one_capture() {
        let config = test_config();
        let queue = Arc::new(CaptureQueue::new(16));
        let mut worker = worker(&config, Arc::clone(&queue));

        // Streak builds across frames; one capture, then cooldown silence.
        for t in 1..=10 {
            worker.process_frame(&sharp_frame(t, t));
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn blurry_capture_reopens_instead_of_enqueueing() {
        let config = test_config();
        let queue = Arc::new(CaptureQueue::new(16));
        let mut worker = worker(&config, Arc::clone(&queue));

        // Flat frames: stable bbox but zero sharpness.
        for t in 1..=10 {
            let mut frame = sharp_frame(t, t);
            frame.pixels = vec![128u8; frame.pixels.len()];
            worker.process_frame(&frame);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn synthetic_frames_bypass_detection() {
        let config = test_config();
        let queue = Arc::new(CaptureQueue::new(16));
        let mut worker = worker(&config, Arc::clone(&queue));

        for t in 1..=10 {
            let mut frame = sharp_frame(t, t);
            frame.synthetic = true;
            worker.process_frame(&frame);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let queue = CaptureQueue::new(2);
        for track_id in 1..=3 {
            queue.push(CaptureJob {
                camera_id: "cam1".to_string(),
                direction: None,
                track_id,
                timestamp: track_id,
                detect_confidence: 0.8,
                roi_jpeg: Vec::new(),
                full_jpeg: Vec::new(),
            });
        }
        assert_eq!(queue.len(), 2);
        let first = queue.pop_timeout(Duration::from_millis(10)).expect("job");
        assert_eq!(first.track_id, 2, "oldest job must have been dropped");
    }

    struct FixedEngine(&'static str);

    impl RecognitionEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn recognize(&self, _jpeg: &[u8]) -> Result<Option<EngineReading>> {
            Ok(Some(EngineReading {
                text: self.0.to_string(),
                confidence: 0.9,
            }))
        }
    }

    fn recognition_worker(
        engine: &'static str,
        store: Arc<Mutex<dyn DetectionStore>>,
        image_dir: &Path,
    ) -> RecognitionWorker {
        let dispatcher = Dispatcher::new(
            Arc::new(FixedEngine(engine)),
            Arc::new(FixedEngine(engine)),
            RecognitionPolicy::Single,
            0.6,
            Duration::from_secs(1),
        );
        RecognitionWorker::new(
            Arc::new(CaptureQueue::new(4)),
            dispatcher,
            Arc::new(Deduplicator::new(
                Duration::from_secs(180),
                crate::dedup::DedupScope::PerCamera,
            )),
            Arc::new(PersistenceCoordinator::new(store, None, Box::new(LogNotifier))),
            image_dir.to_path_buf(),
        )
    }

    fn job() -> CaptureJob {
        CaptureJob {
            camera_id: "cam1".to_string(),
            direction: Some("IN".to_string()),
            track_id: 1,
            timestamp: 1_000,
            detect_confidence: 0.8,
            roi_jpeg: vec![1, 2, 3],
            full_jpeg: vec![4, 5, 6],
        }
    }

    #[test]
    fn recognized_plate_is_persisted_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store: Arc<Mutex<dyn DetectionStore>> =
            Arc::new(Mutex::new(MemoryDetectionStore::new()));
        let worker = recognition_worker("MH01AB1234", Arc::clone(&store), dir.path());

        // Same plate twice inside the cooldown window: one row.
        worker.handle(job());
        worker.handle(job());

        let mut guard = store.lock().unwrap();
        let rows = guard.by_plate("MH01AB1234", 10)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].camera_id, "cam1");
        assert!(rows[0].roi_image_path.is_some());
        Ok(())
    }

    #[test]
    fn invalid_reading_is_never_persisted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store: Arc<Mutex<dyn DetectionStore>> =
            Arc::new(Mutex::new(MemoryDetectionStore::new()));
        let worker = recognition_worker("NOT A PLATE", Arc::clone(&store), dir.path());

        worker.handle(job());
        let mut guard = store.lock().unwrap();
        assert!(guard.recent(10)?.is_empty());
        Ok(())
    }
}
