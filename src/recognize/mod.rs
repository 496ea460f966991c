//! Recognition dispatch.
//!
//! The dispatcher owns the configured engines and applies one of three
//! policies:
//!
//! - `single`: the fast engine alone; its failure is the capture's
//!   failure.
//! - `fallback`: fast engine first; the accurate engine runs when the
//!   fast answer is low-confidence or fails grammar validation.
//! - `compare`: both engines race on their own threads; the winner is
//!   the result whose text passes validation, preferring the faster
//!   engine when both do.
//!
//! Engine calls carry their own timeouts; a timed-out or erroring engine
//! degrades to "no result" and the dispatcher works with what remains.

mod engine;

pub use engine::{EngineReading, LlamaServerEngine, OllamaEngine, RecognitionEngine};

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RecognitionSettings;
use crate::plate::PlateValidator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecognitionPolicy {
    Single,
    Fallback,
    Compare,
}

impl RecognitionPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single" => Some(RecognitionPolicy::Single),
            "fallback" | "hybrid" => Some(RecognitionPolicy::Fallback),
            "compare" => Some(RecognitionPolicy::Compare),
            _ => None,
        }
    }
}

/// Validated dispatch outcome for one crop.
#[derive(Clone, Debug)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
    pub engine: &'static str,
    pub duration: Duration,
}

/// Routes crops to the configured engines.
pub struct Dispatcher {
    fast: Arc<dyn RecognitionEngine>,
    accurate: Arc<dyn RecognitionEngine>,
    policy: RecognitionPolicy,
    fallback_confidence: f32,
    engine_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        fast: Arc<dyn RecognitionEngine>,
        accurate: Arc<dyn RecognitionEngine>,
        policy: RecognitionPolicy,
        fallback_confidence: f32,
        engine_timeout: Duration,
    ) -> Self {
        Self {
            fast,
            accurate,
            policy,
            fallback_confidence,
            engine_timeout,
        }
    }

    pub fn from_settings(settings: &RecognitionSettings) -> Self {
        Self::new(
            Arc::new(OllamaEngine::new(
                &settings.fast_engine_url,
                &settings.fast_model,
                settings.engine_timeout,
            )),
            Arc::new(LlamaServerEngine::new(
                &settings.accurate_engine_url,
                settings.engine_timeout,
            )),
            settings.policy,
            settings.fallback_confidence,
            settings.engine_timeout,
        )
    }

    /// Recognize a crop. `None` is a data-quality rejection: no engine
    /// produced a usable reading.
    pub fn recognize(&self, jpeg: &[u8]) -> Option<Recognition> {
        match self.policy {
            RecognitionPolicy::Single => self.call(&self.fast, jpeg),
            RecognitionPolicy::Fallback => self.fallback(jpeg),
            RecognitionPolicy::Compare => self.compare(jpeg),
        }
    }

    fn call(&self, engine: &Arc<dyn RecognitionEngine>, jpeg: &[u8]) -> Option<Recognition> {
        let started = Instant::now();
        match engine.recognize(jpeg) {
            Ok(Some(reading)) => Some(Recognition {
                text: reading.text,
                confidence: reading.confidence,
                engine: engine.name(),
                duration: started.elapsed(),
            }),
            Ok(None) => {
                log::debug!("engine {} found no plate", engine.name());
                None
            }
            Err(e) => {
                log::warn!("engine {} failed: {}", engine.name(), e);
                None
            }
        }
    }

    fn fallback(&self, jpeg: &[u8]) -> Option<Recognition> {
        if let Some(result) = self.call(&self.fast, jpeg) {
            let grammar_ok = PlateValidator::validate(&result.text).is_some();
            if grammar_ok && result.confidence >= self.fallback_confidence {
                return Some(result);
            }
            log::debug!(
                "fast engine answer '{}' (confidence {:.2}, grammar_ok={}) below bar; \
                 falling back to {}",
                result.text,
                result.confidence,
                grammar_ok,
                self.accurate.name()
            );
        }
        self.call(&self.accurate, jpeg)
    }

    /// Race both engines on their own threads and pick deterministically:
    /// grammar-valid beats invalid, then faster beats slower.
    fn compare(&self, jpeg: &[u8]) -> Option<Recognition> {
        let (tx, rx) = mpsc::channel();
        let payload: Arc<[u8]> = Arc::from(jpeg);
        for engine in [Arc::clone(&self.fast), Arc::clone(&self.accurate)] {
            let tx = tx.clone();
            let payload = Arc::clone(&payload);
            std::thread::spawn(move || {
                let started = Instant::now();
                let outcome = engine.recognize(&payload);
                // The receiver may have given up; a send error is fine.
                let _ = tx.send((engine.name(), started.elapsed(), outcome));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.engine_timeout + Duration::from_secs(1);
        let mut results: Vec<Recognition> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((name, duration, Ok(Some(reading)))) => {
                    results.push(Recognition {
                        text: reading.text,
                        confidence: reading.confidence,
                        engine: name,
                        duration,
                    });
                }
                Ok((name, _, Ok(None))) => log::debug!("engine {} found no plate", name),
                Ok((name, _, Err(e))) => log::warn!("engine {} failed: {}", name, e),
                Err(_) => break, // all senders done, or deadline passed
            }
        }

        results.sort_by_key(|r| {
            (
                PlateValidator::validate(&r.text).is_none(), // valid first
                r.duration,
            )
        });
        let winner = results.into_iter().next();
        if let Some(w) = &winner {
            log::debug!(
                "compare winner: {} '{}' in {:?}",
                w.engine,
                w.text,
                w.duration
            );
        }
        winner
    }
}
