//! Download jobs, their files, and the transfer seam.
//!
//! Ownership runs strictly scheduler → job → file; files refer back to
//! their job only by [`JobId`] and index. The byte-moving side is behind
//! the [`Transfer`] trait so the scheduler can be exercised without a
//! network.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::policy::Priority;

/// Identifier of a job within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

/// Description of one file to download.
#[derive(Debug, Clone)]
pub struct FileSpec {
    /// Absolute URL to fetch.
    pub url: String,
    /// Where the bytes land.
    pub dest: PathBuf,
    /// Declared size, when the caller knows it.
    pub expected_size: Option<u64>,
    /// Whether partial bytes may be kept and the transfer restarted with
    /// a `Range` request.
    pub supports_resume: bool,
    /// Fixed lower bound of the ranged request (self-extracting offset);
    /// resume offsets are added on top.
    pub range_start: u64,
}

impl FileSpec {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            expected_size: None,
            supports_resume: false,
            range_start: 0,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_resume(mut self, supports_resume: bool) -> Self {
        self.supports_resume = supports_resume;
        self
    }

    pub fn with_range_start(mut self, range_start: u64) -> Self {
        self.range_start = range_start;
        self
    }
}

/// Lifecycle of one file within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    /// Waiting for a scheduler slot.
    Queued,
    /// A worker is moving bytes.
    Running,
    /// Stopped with partial bytes retained; restartable.
    Paused,
    /// All bytes received.
    Done,
    /// Permanently failed.
    Failed(String),
    /// Stopped by job cancellation.
    Cancelled,
}

impl FileState {
    /// Whether the file will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_) | Self::Cancelled)
    }
}

/// Result of one transfer attempt, reported by the [`Transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The transfer ran to the end of the body.
    Complete {
        /// Bytes written to the destination.
        bytes: u64,
        /// Whether the server honoured the ranged request (when one was
        /// sent); `false` means the body started from byte zero.
        ranged: bool,
    },
    /// Stopped at a chunk boundary after a pause request.
    Paused { bytes: u64 },
    /// Stopped at a chunk boundary after a cancel request.
    Cancelled,
    /// The attempt failed; `retryable` transient errors re-queue the file.
    Failed { reason: String, retryable: bool },
}

/// Shared control block between the scheduler and one running transfer.
///
/// The transfer polls [`TransferControl::stop_requested`] between
/// buffer-sized reads and publishes progress through the byte counter.
#[derive(Debug, Default)]
pub struct TransferControl {
    pause: AtomicBool,
    cancel: AtomicBool,
    bytes: AtomicU64,
}

/// Why a transfer should stop at the next chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Pause,
    Cancel,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_pause(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    /// Cancel wins over pause when both are requested.
    pub fn stop_requested(&self) -> Option<StopKind> {
        if self.cancel.load(Ordering::Relaxed) {
            Some(StopKind::Cancel)
        } else if self.pause.load(Ordering::Relaxed) {
            Some(StopKind::Pause)
        } else {
            None
        }
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Capability to move the bytes of one file.
///
/// `resume_from` is the number of destination bytes already present from
/// a previous attempt (zero for a fresh transfer); implementations add it
/// to `spec.range_start` when forming a `Range` request.
pub trait Transfer: Send + Sync {
    fn run(&self, spec: &FileSpec, resume_from: u64, ctl: &TransferControl) -> FileOutcome;
}

/// Per-file summary returned to the caller when a job completes.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub url: String,
    pub bytes: u64,
    /// Whether the server honoured the file's ranged request.
    pub ranged: bool,
}

/// Final result of a job.
#[derive(Debug, Clone)]
pub enum JobResult {
    /// Every file completed; reports are in file insertion order.
    Completed(Vec<FileReport>),
    /// At least one file failed permanently.
    Failed { reason: String },
    /// The job was removed before completion.
    Cancelled,
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Priority plus the ordered files of one job, as submitted by callers.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub priority: Priority,
    pub files: Vec<FileSpec>,
}

impl JobSpec {
    pub fn new(priority: Priority, files: Vec<FileSpec>) -> Self {
        Self { priority, files }
    }
}
