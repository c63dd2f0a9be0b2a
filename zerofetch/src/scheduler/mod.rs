//! The download scheduler: a priority queue of jobs with a worker cap.
//!
//! Jobs hold ordered sets of files. At most `max_simultaneous` transfers
//! run at once; higher-priority arrivals preempt lower-priority jobs by
//! pausing transfers that support resume. A file that cannot resume runs
//! to completion once started, even while that keeps the in-flight count
//! above the cap.
//!
//! All queue state lives behind a single lock. The lock is never held
//! across I/O: dispatch decides what to start or pause while holding it,
//! releases it, and only then touches worker threads.
//!
//! Ordering guarantees: within a job, files start in insertion order;
//! across jobs, start order is (priority, job insertion order).

mod job;
mod policy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

pub use job::{
    FileOutcome, FileReport, FileSpec, FileState, JobId, JobResult, JobSpec, StopKind, Transfer,
    TransferControl,
};
pub use policy::{Priority, RetryPolicy};

/// Default cap on simultaneous transfers.
pub const DEFAULT_MAX_SIMULTANEOUS: usize = 2;

/// Priority-scheduled, resumable download queue.
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    settled: Condvar,
    transfer: Arc<dyn Transfer>,
    max_simultaneous: usize,
    retry: RetryPolicy,
}

#[derive(Default)]
struct SchedulerState {
    jobs: BTreeMap<u64, JobEntry>,
    next_id: u64,
}

struct JobEntry {
    priority: Priority,
    cancelled: bool,
    files: Vec<FileEntry>,
}

struct FileEntry {
    spec: FileSpec,
    state: FileState,
    attempts: u32,
    bytes: u64,
    ranged: bool,
    ctl: Arc<TransferControl>,
}

/// Work picked by dispatch while the lock was held.
struct StartItem {
    job: JobId,
    index: usize,
    spec: FileSpec,
    resume_from: u64,
    ctl: Arc<TransferControl>,
    backoff: Option<Duration>,
}

impl DownloadScheduler {
    pub fn new(transfer: Arc<dyn Transfer>, max_simultaneous: usize, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                settled: Condvar::new(),
                transfer,
                max_simultaneous: max_simultaneous.max(1),
                retry,
            }),
        }
    }

    /// Enqueue a job. Files duplicated within the job (same URL) are
    /// dropped, keeping the first occurrence.
    pub fn add_job(&self, spec: JobSpec) -> JobId {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let mut files: Vec<FileEntry> = Vec::new();
            for file in spec.files {
                if files.iter().any(|f| f.spec.url == file.url) {
                    warn!(url = %file.url, "dropping duplicate file within job");
                    continue;
                }
                files.push(FileEntry {
                    spec: file,
                    state: FileState::Queued,
                    attempts: 0,
                    bytes: 0,
                    ranged: false,
                    ctl: Arc::new(TransferControl::new()),
                });
            }
            state.jobs.insert(
                id,
                JobEntry {
                    priority: spec.priority,
                    cancelled: false,
                    files,
                },
            );
            debug!(job = id, priority = ?spec.priority, "job added");
            id
        };
        dispatch(&self.inner);
        JobId(id)
    }

    /// Cancel a job. Running transfers stop at their next chunk boundary.
    pub fn remove_job(&self, job: JobId) {
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.jobs.get_mut(&job.0) {
                entry.cancelled = true;
                for file in &mut entry.files {
                    match file.state {
                        FileState::Queued | FileState::Paused => {
                            file.state = FileState::Cancelled;
                        }
                        FileState::Running => file.ctl.request_cancel(),
                        _ => {}
                    }
                }
                if job_settled(entry) {
                    self.inner.settled.notify_all();
                }
            }
        }
        dispatch(&self.inner);
    }

    /// Change a job's priority; may preempt lower-priority work.
    pub fn update_job(&self, job: JobId, priority: Priority) {
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.jobs.get_mut(&job.0) {
                entry.priority = priority;
            }
        }
        dispatch(&self.inner);
    }

    /// Block until the job settles. `None` for an unknown job id.
    pub fn wait_job(&self, job: JobId) -> Option<JobResult> {
        let mut state = self.inner.state.lock();
        loop {
            let entry = state.jobs.get(&job.0)?;
            if let Some(result) = job_result(entry) {
                return Some(result);
            }
            self.inner.settled.wait(&mut state);
        }
    }

    /// The job's result if it has settled, without blocking.
    pub fn try_job_result(&self, job: JobId) -> Option<JobResult> {
        let state = self.inner.state.lock();
        state.jobs.get(&job.0).and_then(job_result)
    }

    /// Total bytes currently received for a job, across all its files.
    pub fn job_bytes(&self, job: JobId) -> u64 {
        let state = self.inner.state.lock();
        state
            .jobs
            .get(&job.0)
            .map(|entry| {
                entry
                    .files
                    .iter()
                    .map(|f| match f.state {
                        FileState::Running => f.ctl.bytes(),
                        _ => f.bytes,
                    })
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// A transfer attempt finished; record the outcome and reschedule.
fn update_file(inner: &Arc<SchedulerInner>, job: JobId, index: usize, outcome: FileOutcome) {
    {
        let mut state = inner.state.lock();
        let Some(entry) = state.jobs.get_mut(&job.0) else {
            return;
        };

        let mut fail_fast = false;
        {
            let file = &mut entry.files[index];
            match outcome {
                FileOutcome::Complete { bytes, ranged } => {
                    file.state = FileState::Done;
                    file.bytes = bytes;
                    file.ranged = ranged;
                }
                FileOutcome::Paused { bytes } => {
                    file.bytes = if file.spec.supports_resume { bytes } else { 0 };
                    file.state = if entry.cancelled {
                        FileState::Cancelled
                    } else {
                        FileState::Paused
                    };
                }
                FileOutcome::Cancelled => {
                    file.state = FileState::Cancelled;
                }
                FileOutcome::Failed { reason, retryable } => {
                    file.attempts += 1;
                    let retry_allowed = retryable
                        && !entry.cancelled
                        && inner.retry.delay_for_attempt(file.attempts).is_some();
                    if retry_allowed {
                        if !file.spec.supports_resume {
                            file.bytes = 0;
                        }
                        debug!(
                            url = %file.spec.url,
                            attempt = file.attempts,
                            reason = %reason,
                            "transfer failed, will retry"
                        );
                        file.state = FileState::Queued;
                    } else {
                        warn!(url = %file.spec.url, reason = %reason, "transfer failed");
                        file.state = FileState::Failed(reason);
                        fail_fast = true;
                    }
                }
            }
        }

        // One permanent failure sinks the job; stop its other files.
        if fail_fast {
            for file in &mut entry.files {
                match file.state {
                    FileState::Queued | FileState::Paused => file.state = FileState::Cancelled,
                    FileState::Running => file.ctl.request_cancel(),
                    _ => {}
                }
            }
        }

        if job_settled(entry) {
            inner.settled.notify_all();
        }
    }
    dispatch(inner);
}

/// Start and pause transfers until capacity and priorities agree.
///
/// Runs entirely under the state lock except for the final worker
/// spawning.
fn dispatch(inner: &Arc<SchedulerInner>) {
    let mut to_start: Vec<StartItem> = Vec::new();
    {
        let mut state = inner.state.lock();
        loop {
            let Some((job_id, index, priority)) = find_candidate(&state) else {
                break;
            };

            // Count running transfers against the cap. Lower-priority
            // files that cannot be paused are exempt: they run to
            // completion above the cap rather than block this candidate.
            let mut countable = 0usize;
            let mut victims: Vec<(Priority, u64, usize)> = Vec::new();
            for (id, entry) in &state.jobs {
                for (i, file) in entry.files.iter().enumerate() {
                    if file.state != FileState::Running {
                        continue;
                    }
                    let lower = entry.priority < priority;
                    if !(lower && !file.spec.supports_resume) {
                        countable += 1;
                    }
                    if lower && file.spec.supports_resume && file.ctl.stop_requested().is_none() {
                        victims.push((entry.priority, *id, i));
                    }
                }
            }

            if countable < inner.max_simultaneous {
                let entry = state.jobs.get_mut(&job_id).expect("candidate job exists");
                let file = &mut entry.files[index];
                file.state = FileState::Running;
                file.ctl.clear_pause();
                let resume_from = if file.spec.supports_resume {
                    file.bytes
                } else {
                    0
                };
                file.ctl.set_bytes(resume_from);
                let backoff = if file.attempts > 0 {
                    inner.retry.delay_for_attempt(file.attempts)
                } else {
                    None
                };
                to_start.push(StartItem {
                    job: JobId(job_id),
                    index,
                    spec: file.spec.clone(),
                    resume_from,
                    ctl: Arc::clone(&file.ctl),
                    backoff,
                });
                continue;
            }

            // Over capacity: pause just enough lower-priority resumable
            // transfers; the candidate starts once they report back.
            let needed = countable + 1 - inner.max_simultaneous;
            victims.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(b.2.cmp(&a.2)));
            for (_, vjob, vindex) in victims.into_iter().take(needed) {
                debug!(job = vjob, file = vindex, "pausing transfer for preemption");
                state.jobs[&vjob].files[vindex].ctl.request_pause();
            }
            break;
        }
    }

    for item in to_start {
        spawn_worker(Arc::clone(inner), item);
    }
}

/// The highest-priority startable file: jobs by (priority desc, insertion
/// asc), files by insertion order.
fn find_candidate(state: &SchedulerState) -> Option<(u64, usize, Priority)> {
    let mut order: Vec<(Priority, u64)> = state
        .jobs
        .iter()
        .filter(|(_, entry)| !entry.cancelled)
        .map(|(id, entry)| (entry.priority, *id))
        .collect();
    order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (priority, id) in order {
        let entry = &state.jobs[&id];
        for (index, file) in entry.files.iter().enumerate() {
            if matches!(file.state, FileState::Queued | FileState::Paused) {
                return Some((id, index, priority));
            }
        }
    }
    None
}

fn spawn_worker(inner: Arc<SchedulerInner>, item: StartItem) {
    let (job, index) = (item.job, item.index);
    let fallback = Arc::clone(&inner);
    let builder = thread::Builder::new().name(format!("transfer-{}-{}", job.0, index));
    let spawned = builder.spawn(move || {
        if let Some(delay) = item.backoff {
            thread::sleep(delay);
        }
        let outcome = match item.ctl.stop_requested() {
            Some(StopKind::Cancel) => FileOutcome::Cancelled,
            Some(StopKind::Pause) => FileOutcome::Paused {
                bytes: item.resume_from,
            },
            None => inner
                .transfer
                .run(&item.spec, item.resume_from, &item.ctl),
        };
        update_file(&inner, item.job, item.index, outcome);
    });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn transfer worker");
        update_file(
            &fallback,
            job,
            index,
            FileOutcome::Failed {
                reason: "could not spawn worker thread".to_string(),
                retryable: false,
            },
        );
    }
}

fn job_settled(entry: &JobEntry) -> bool {
    entry.files.iter().all(|f| f.state.is_terminal())
}

fn job_result(entry: &JobEntry) -> Option<JobResult> {
    if !job_settled(entry) {
        return None;
    }
    if entry
        .files
        .iter()
        .all(|f| matches!(f.state, FileState::Done))
    {
        let reports = entry
            .files
            .iter()
            .map(|f| FileReport {
                url: f.spec.url.clone(),
                bytes: f.bytes,
                ranged: f.ranged,
            })
            .collect();
        return Some(JobResult::Completed(reports));
    }
    for file in &entry.files {
        if let FileState::Failed(reason) = &file.state {
            return Some(JobResult::Failed {
                reason: reason.clone(),
            });
        }
    }
    Some(JobResult::Cancelled)
}
