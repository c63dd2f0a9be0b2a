//! Progress reporting and cancellation for long-running operations.
//!
//! The core never talks to a UI directly; callers hand in a [`TaskHandler`]
//! and receive stage notifications and progress updates through it. The
//! handler also carries the cancellation signal, checked between buffer-sized
//! chunks of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Collaborator interface for progress reporting and cancellation.
///
/// All methods have no-op defaults so implementors only override what they
/// display.
pub trait TaskHandler: Send + Sync {
    /// A download is about to begin.
    fn starting_download(&self, _url: &str) {}

    /// Bytes received so far for one download; `total` when known.
    fn download_progress(&self, _url: &str, _bytes: u64, _total: Option<u64>) {}

    /// An archive is about to be extracted into a staging directory.
    fn starting_extraction(&self, _name: &str) {}

    /// A manifest is about to be computed over a staged tree.
    fn starting_manifest(&self, _name: &str) {}

    /// Polled between chunks of work; `true` aborts at the next boundary.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Whether the caller runs unattended (no interactive prompts).
    fn batch(&self) -> bool {
        true
    }
}

/// A handler that reports nothing and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHandler;

impl TaskHandler for SilentHandler {}

/// A handler carrying an externally-controlled cancellation flag.
///
/// Useful for driving the core from a thread that owns a cancel button.
#[derive(Debug, Default, Clone)]
pub struct CancelFlagHandler {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlagHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared flag; set it to request cancellation.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl TaskHandler for CancelFlagHandler {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
