//! platewatchd - ANPR capture daemon
//!
//! This daemon:
//! 1. Ingests frames from the configured cameras (MJPEG or stub streams)
//! 2. Gates frames on motion, then runs two-stage vehicle/plate detection
//! 3. Tracks plate regions until they are stable and sharp enough
//! 4. Recognizes crops through the configured vision engines
//! 5. Validates, deduplicates and persists accepted detections locally
//! 6. Syncs rows to the remote store and cleans up transient images

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use platewatch::config::{CameraSettings, DetectSettings};
use platewatch::detect::{StubDetector, TwoStageDetector};
use platewatch::store::{DetectionStore, LogNotifier, RemoteSync, SqliteDetectionStore};
use platewatch::{Config, PersistenceCoordinator};

#[derive(Parser, Debug)]
#[command(name = "platewatchd", version, about = "ANPR capture daemon")]
struct Args {
    /// Path to the TOML config file (or set PLATEWATCH_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the detection database path.
    #[arg(long, env = "PLATEWATCH_DB")]
    db: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let store = SqliteDetectionStore::open(&config.db_path)
        .with_context(|| format!("open detection store {}", config.db_path))?;
    let store: Arc<Mutex<dyn DetectionStore>> = Arc::new(Mutex::new(store));
    let coordinator = Arc::new(PersistenceCoordinator::new(
        Arc::clone(&store),
        RemoteSync::from_settings(&config.sync),
        Box::new(LogNotifier),
    ));

    log::info!(
        "platewatchd {} starting: {} camera(s), db={}, policy={:?}",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len(),
        config.db_path,
        config.recognition.policy
    );
    if config.sync.remote_url.is_none() {
        log::info!("no remote store configured; running local-only");
    }

    let detect = config.detect;
    let pipeline = platewatch::pipeline::Pipeline::start(&config, coordinator, |camera| {
        build_detector(camera, detect)
    })?;

    let flag = pipeline.shutdown_flag();
    ctrlc::set_handler({
        let flag = Arc::clone(&flag);
        move || {
            log::info!("shutdown requested");
            flag.store(true, Ordering::Relaxed);
        }
    })
    .context("install signal handler")?;

    while !flag.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    pipeline.stop();
    log::info!("platewatchd stopped");
    Ok(())
}

/// One detector pair per camera. The stub backend emits no regions; real
/// deployments plug a model-backed `Detector` in here.
fn build_detector(camera: &CameraSettings, settings: DetectSettings) -> TwoStageDetector {
    log::debug!("[{}] using stub detection backends", camera.id);
    TwoStageDetector::new(
        Box::new(StubDetector::new()),
        Box::new(StubDetector::new()),
        settings,
    )
}
