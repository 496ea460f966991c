//! Persistence sequencing for accepted detections.
//!
//! Order is fixed: local append (retried, the record must not be lost),
//! then notification, then one best-effort remote push. A failed push
//! leaves the row unsynced for the periodic sync pass; a failed local
//! append after all retries is the only hard error.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{DetectionRecord, DetectionStore, RemoteSync};

const LOCAL_WRITE_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(250);

/// Observer for newly persisted detections.
pub trait DetectionNotifier: Send + Sync {
    fn publish(&self, record: &DetectionRecord);
}

/// Default notifier: one structured log line per detection.
pub struct LogNotifier;

impl DetectionNotifier for LogNotifier {
    fn publish(&self, record: &DetectionRecord) {
        log::info!(
            "detection: plate={} type={} camera={} direction={} confidence={:.2} engine={} ({}ms)",
            record.plate,
            record.vehicle_type.as_str(),
            record.camera_id,
            record.direction.as_deref().unwrap_or("-"),
            record.confidence,
            record.engine,
            record.processing_ms
        );
    }
}

pub struct PersistenceCoordinator {
    store: Arc<Mutex<dyn DetectionStore>>,
    remote: Option<RemoteSync>,
    notifier: Box<dyn DetectionNotifier>,
    retry_base: Duration,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<Mutex<dyn DetectionStore>>,
        remote: Option<RemoteSync>,
        notifier: Box<dyn DetectionNotifier>,
    ) -> Self {
        Self {
            store,
            remote,
            notifier,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    /// Shrink retry backoff; used by tests to keep retries fast.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn store(&self) -> Arc<Mutex<dyn DetectionStore>> {
        Arc::clone(&self.store)
    }

    fn lock_store(&self) -> MutexGuard<'_, dyn DetectionStore + 'static> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist one accepted detection. Returns the local row id.
    pub fn record(&self, record: &DetectionRecord) -> Result<i64> {
        let id = self.append_with_retry(record)?;

        let mut stored = record.clone();
        stored.id = Some(id);
        self.notifier.publish(&stored);

        if let Some(remote) = &self.remote {
            match remote.push(&stored) {
                Ok(()) => self.lock_store().mark_synced(id)?,
                Err(e) => log::warn!(
                    "inline sync of {} failed, left for periodic pass: {:#}",
                    stored.plate,
                    e
                ),
            }
        }
        Ok(id)
    }

    fn append_with_retry(&self, record: &DetectionRecord) -> Result<i64> {
        let mut backoff = self.retry_base;
        for attempt in 1..=LOCAL_WRITE_ATTEMPTS {
            match self.lock_store().append(record) {
                Ok(id) => return Ok(id),
                Err(e) if attempt < LOCAL_WRITE_ATTEMPTS => {
                    log::warn!(
                        "local append of {} failed (attempt {}/{}): {:#}",
                        record.plate,
                        attempt,
                        LOCAL_WRITE_ATTEMPTS,
                        e
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "detection {} lost: local append failed {} times",
                            record.plate, LOCAL_WRITE_ATTEMPTS
                        )
                    });
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::super::{sample_record, MemoryDetectionStore};
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` appends, then delegates to a real
    /// in-memory store.
    struct FlakyStore {
        inner: MemoryDetectionStore,
        failures: usize,
        attempts: usize,
    }

    impl DetectionStore for FlakyStore {
        fn append(&mut self, record: &DetectionRecord) -> Result<i64> {
            self.attempts += 1;
            if self.attempts <= self.failures {
                return Err(anyhow!("disk full"));
            }
            self.inner.append(record)
        }

        fn recent(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
            self.inner.recent(limit)
        }

        fn by_plate(&mut self, plate: &str, limit: usize) -> Result<Vec<DetectionRecord>> {
            self.inner.by_plate(plate, limit)
        }

        fn unsynced(&mut self, limit: usize) -> Result<Vec<DetectionRecord>> {
            self.inner.unsynced(limit)
        }

        fn mark_synced(&mut self, id: i64) -> Result<()> {
            self.inner.mark_synced(id)
        }

        fn cleanup_candidates(&mut self, cutoff: u64) -> Result<Vec<DetectionRecord>> {
            self.inner.cleanup_candidates(cutoff)
        }

        fn clear_roi_path(&mut self, id: i64) -> Result<()> {
            self.inner.clear_roi_path(id)
        }
    }

    struct CountingNotifier(AtomicUsize);

    impl DetectionNotifier for CountingNotifier {
        fn publish(&self, _record: &DetectionRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn transient_append_failures_are_retried() -> Result<()> {
        let store: Arc<Mutex<dyn DetectionStore>> = Arc::new(Mutex::new(FlakyStore {
            inner: MemoryDetectionStore::new(),
            failures: 2,
            attempts: 0,
        }));
        let coordinator = PersistenceCoordinator::new(Arc::clone(&store), None, Box::new(LogNotifier))
            .with_retry_base(Duration::from_millis(1));

        let id = coordinator.record(&sample_record("MH01AB1234", "cam1", 1_000))?;
        assert!(id > 0);

        // Exactly one row despite the retries.
        let mut guard = store.lock().unwrap();
        assert_eq!(guard.by_plate("MH01AB1234", 10)?.len(), 1);
        Ok(())
    }

    /// One-shot HTTP listener: accepts a single request, captures it and
    /// answers 200 with an empty body.
    fn one_shot_remote() -> Result<(String, std::thread::JoinHandle<Result<Vec<u8>>>)> {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}", listener.local_addr()?);
        let handle = std::thread::spawn(move || -> Result<Vec<u8>> {
            let (mut stream, _) = listener.accept()?;
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let read = stream.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let body_len = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
            stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")?;
            Ok(request)
        });
        Ok((url, handle))
    }

    #[test]
    fn remote_push_still_happens_after_retried_local_write() -> Result<()> {
        let (url, server) = one_shot_remote()?;
        let remote = RemoteSync::from_settings(&crate::config::SyncSettings {
            remote_url: Some(url),
            remote_token: None,
            interval: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(1200),
        });

        let store: Arc<Mutex<dyn DetectionStore>> = Arc::new(Mutex::new(FlakyStore {
            inner: MemoryDetectionStore::new(),
            failures: 2,
            attempts: 0,
        }));
        let coordinator =
            PersistenceCoordinator::new(Arc::clone(&store), remote, Box::new(LogNotifier))
                .with_retry_base(Duration::from_millis(1));
        coordinator.record(&sample_record("MH01AB1234", "cam1", 1_000))?;

        // The flaky local writes must not swallow the inline sync.
        let request = server.join().expect("server thread")?;
        assert!(
            String::from_utf8_lossy(&request).contains("MH01AB1234"),
            "remote never received the detection"
        );
        let mut guard = store.lock().unwrap();
        assert!(guard.unsynced(10)?.is_empty(), "row must be marked synced");
        Ok(())
    }

    #[test]
    fn persistent_append_failure_is_surfaced() {
        let store: Arc<Mutex<dyn DetectionStore>> = Arc::new(Mutex::new(FlakyStore {
            inner: MemoryDetectionStore::new(),
            failures: usize::MAX,
            attempts: 0,
        }));
        let coordinator = PersistenceCoordinator::new(store, None, Box::new(LogNotifier))
            .with_retry_base(Duration::from_millis(1));

        assert!(coordinator
            .record(&sample_record("MH01AB1234", "cam1", 1_000))
            .is_err());
    }

    #[test]
    fn notifier_fires_once_per_detection() -> Result<()> {
        let store: Arc<Mutex<dyn DetectionStore>> =
            Arc::new(Mutex::new(MemoryDetectionStore::new()));
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));

        struct Shared(Arc<CountingNotifier>);
        impl DetectionNotifier for Shared {
            fn publish(&self, record: &DetectionRecord) {
                self.0.publish(record);
            }
        }

        let coordinator =
            PersistenceCoordinator::new(store, None, Box::new(Shared(Arc::clone(&notifier))));
        coordinator.record(&sample_record("MH01AB1234", "cam1", 1_000))?;
        coordinator.record(&sample_record("KA05TA9999", "cam1", 1_001))?;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn unreachable_remote_leaves_row_unsynced() -> Result<()> {
        let settings = crate::config::SyncSettings {
            remote_url: Some("http://127.0.0.1:9".to_string()),
            remote_token: None,
            interval: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(1200),
        };
        let remote = RemoteSync::from_settings(&settings);
        let store: Arc<Mutex<dyn DetectionStore>> =
            Arc::new(Mutex::new(MemoryDetectionStore::new()));
        let coordinator =
            PersistenceCoordinator::new(Arc::clone(&store), remote, Box::new(LogNotifier));

        coordinator.record(&sample_record("MH01AB1234", "cam1", 1_000))?;
        let mut guard = store.lock().unwrap();
        assert_eq!(guard.unsynced(10)?.len(), 1);
        Ok(())
    }
}
