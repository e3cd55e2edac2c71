//! The dispatcher's view of the capture engine, plus a software engine used by
//! the emulator and the in-process simulator.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// One captured sample of the monitored bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Capture-clock timestamp
    pub timestamp: u64,
    /// Bus value, least significant byte first
    pub data: Bytes,
}

/// Operations the dispatcher issues to the capture engine.
///
/// `capture_finished` is a level from the capture clock domain; callers must
/// pass it through a [`Synchronizer`](crate::sync::Synchronizer).
pub trait CaptureEngine {
    /// Abort any capture in flight and clear the finished level.
    fn reset(&mut self);

    /// Called once when a configuration load starts.
    fn begin_reconfigure(&mut self) {}

    /// Called once per assembled 32-bit word, in stream order.
    fn commit_word(&mut self, word: u32);

    /// Called once after the last word of a configuration.
    fn finish_reconfigure(&mut self);

    fn capture_finished(&self) -> bool;

    /// Random-access read of the sample buffer.
    fn read_sample(&self, address: usize) -> Option<Sample>;
}

/// Capture-domain side of a [`SimCaptureEngine`].
///
/// Cloned into whatever thread plays the role of the sampling clock.
#[derive(Debug, Clone, Default)]
pub struct CaptureHandle {
    finished: Arc<AtomicBool>,
    configurations: Arc<AtomicUsize>,
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl CaptureHandle {
    /// Store a finished capture and raise the finished level.
    pub fn complete(&self, samples: Vec<Sample>) {
        *self.samples.lock().unwrap_or_else(PoisonError::into_inner) = samples;
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Number of trigger configurations committed so far; the engine is armed
    /// once this moves.
    pub fn configurations(&self) -> usize {
        self.configurations.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.finished.store(false, Ordering::Release);
        self.samples.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Software capture engine.
///
/// It does no trigger matching; it records what the dispatcher configured and
/// exposes whatever the [`CaptureHandle`] stored as the sample buffer.
#[derive(Debug, Default)]
pub struct SimCaptureEngine {
    handle: CaptureHandle,
    pending_words: Vec<u32>,
    active_config: Option<Vec<u32>>,
    resets: usize,
}

impl SimCaptureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    /// Words of the last configuration that completed with a finish pulse
    pub fn active_config(&self) -> Option<&[u32]> {
        self.active_config.as_deref()
    }

    /// Words received since the last reset that have not been committed yet
    pub fn pending_words(&self) -> &[u32] {
        &self.pending_words
    }

    pub fn configurations(&self) -> usize {
        self.handle.configurations()
    }

    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl CaptureEngine for SimCaptureEngine {
    fn reset(&mut self) {
        self.resets += 1;
        self.pending_words.clear();
        self.handle.clear();
        debug!("capture engine reset");
    }

    fn commit_word(&mut self, word: u32) {
        self.pending_words.push(word);
    }

    fn finish_reconfigure(&mut self) {
        let words = std::mem::take(&mut self.pending_words);
        info!(words = words.len(), "trigger configuration committed");
        self.active_config = Some(words);
        self.handle.configurations.fetch_add(1, Ordering::AcqRel);
    }

    fn capture_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn read_sample(&self, address: usize) -> Option<Sample> {
        self.handle
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_commit_on_finish() {
        let mut engine = SimCaptureEngine::new();
        engine.reset();
        engine.commit_word(1);
        engine.commit_word(2);
        assert_eq!(engine.active_config(), None);
        assert_eq!(engine.pending_words(), &[1, 2]);

        engine.finish_reconfigure();
        assert_eq!(engine.active_config(), Some(&[1, 2][..]));
        assert!(engine.pending_words().is_empty());
        assert_eq!(engine.configurations(), 1);
    }

    #[test]
    fn test_reset_clears_finished_and_samples() {
        let mut engine = SimCaptureEngine::new();
        let handle = engine.handle();
        handle.complete(vec![Sample {
            timestamp: 42,
            data: Bytes::from_static(&[0xAA, 0x55]),
        }]);

        assert!(engine.capture_finished());
        assert_eq!(engine.read_sample(0).map(|s| s.timestamp), Some(42));
        assert_eq!(engine.read_sample(1), None);

        engine.reset();
        assert!(!engine.capture_finished());
        assert_eq!(engine.read_sample(0), None);
        assert_eq!(engine.resets(), 1);
    }
}
