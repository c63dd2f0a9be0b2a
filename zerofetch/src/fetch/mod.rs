//! The fetcher: makes requested implementations available in the store.
//!
//! For each implementation not already installed, the fetcher picks a
//! retrieval method (direct archive or recipe), downloads the bytes
//! through the scheduler, and hands them to the store for extraction and
//! verify-and-install. Downloads of distinct digests may run in parallel;
//! an in-memory in-flight table guarantees at most one fetch per digest,
//! with losers waiting on the winner and re-checking the store.
//!
//! Error policy: network errors are retried by the scheduler per the
//! configured policy; size and digest mismatches are never retried (the
//! server is authoritatively wrong); an install race surfacing
//! `AlreadyInStore` is success.

mod http;

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FetcherConfig;
use crate::implementation::{Archive, FetchRequest, Implementation, Recipe};
use crate::progress::TaskHandler;
use crate::scheduler::{
    DownloadScheduler, FileReport, FileSpec, JobResult, JobSpec,
};
use crate::store::{ArchiveSource, DirectoryStore, StoreError};

pub use http::HttpTransfer;

/// Errors surfaced by fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The downloaded byte count does not match the declared size.
    #[error("size mismatch for {url}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        expected: u64,
        actual: u64,
        url: String,
    },

    /// A download failed after exhausting its retries.
    #[error("download of {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// The implementation declares no archive and no recipe.
    #[error("implementation has no retrieval method")]
    NoRetrievalMethod,

    /// The operation was cancelled through the task handler.
    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The retrieval method chosen for one implementation.
#[derive(Debug)]
enum Method<'a> {
    Single(&'a Archive),
    Recipe(&'a Recipe),
}

/// How one archive's bytes travel: ranged from its offset, or in full
/// with the offset skipped at extraction time.
struct DownloadPlan<'a> {
    archive: &'a Archive,
    spec: FileSpec,
}

/// Downloads implementations and installs them into a store.
pub struct Fetcher {
    store: Arc<DirectoryStore>,
    scheduler: DownloadScheduler,
    transfer: Arc<HttpTransfer>,
    config: FetcherConfig,
    handler: Arc<dyn TaskHandler>,
    in_flight: Mutex<HashSet<String>>,
    in_flight_changed: Condvar,
}

impl Fetcher {
    pub fn new(
        store: Arc<DirectoryStore>,
        config: FetcherConfig,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let transfer = Arc::new(HttpTransfer::new(config.timeout, Arc::clone(&handler)));
        let scheduler = DownloadScheduler::new(
            transfer.clone() as Arc<dyn crate::scheduler::Transfer>,
            config.max_simultaneous_downloads,
            config.retry.clone(),
        );
        Self {
            store,
            scheduler,
            transfer,
            config,
            handler,
            in_flight: Mutex::new(HashSet::new()),
            in_flight_changed: Condvar::new(),
        }
    }

    pub fn store(&self) -> &Arc<DirectoryStore> {
        &self.store
    }

    /// Make every implementation of the request available in the store.
    ///
    /// Already-installed implementations are skipped, so repeating a
    /// fetch is a no-op.
    pub fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        for implementation in &request.implementations {
            if self.handler.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            self.fetch_one(implementation)?;
        }
        Ok(())
    }

    fn fetch_one(&self, implementation: &Implementation) -> Result<(), FetchError> {
        let key = implementation
            .digest
            .best_string()
            .ok_or(StoreError::NoKnownDigest)?;

        // At most one in-flight fetch per digest: losers wait for the
        // winner, then re-check the store. A loser only becomes the new
        // winner if the previous one failed to install.
        loop {
            if self.store.contains(&implementation.digest) {
                debug!(digest = %key, "already in store, skipping");
                return Ok(());
            }
            let mut in_flight = self.in_flight.lock();
            if in_flight.insert(key.clone()) {
                break;
            }
            self.in_flight_changed.wait(&mut in_flight);
        }

        let result = self.download_and_install(implementation);
        {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(&key);
            self.in_flight_changed.notify_all();
        }
        match result {
            // A concurrent installer (other process, or a raced rename)
            // got there first; the implementation is present either way.
            Err(FetchError::Store(StoreError::AlreadyInStore { digest })) => {
                debug!(digest = %digest, "lost install race, treating as success");
                Ok(())
            }
            other => other,
        }
    }

    fn download_and_install(&self, implementation: &Implementation) -> Result<(), FetchError> {
        let workspace = self.download_workspace()?;

        let result = match select_method(implementation)? {
            Method::Single(archive) => self.fetch_single(implementation, archive, &workspace),
            Method::Recipe(recipe) => self.fetch_recipe(implementation, recipe, &workspace),
        };
        if result.is_ok() {
            info!(digest = %implementation.digest, "implementation fetched");
        }
        result
    }

    fn fetch_single(
        &self,
        implementation: &Implementation,
        archive: &Archive,
        workspace: &TempDir,
    ) -> Result<(), FetchError> {
        let plan = self.plan_download(archive, workspace, 0)?;
        let report = self.run_job(vec![plan.spec.clone()])?.remove(0);
        let source = check_and_describe(archive, &plan.spec, &report)?;

        self.store
            .add_archive(&source, &implementation.digest, &*self.handler)?;
        Ok(())
    }

    fn fetch_recipe(
        &self,
        implementation: &Implementation,
        recipe: &Recipe,
        workspace: &TempDir,
    ) -> Result<(), FetchError> {
        let mut plans = Vec::new();
        for (index, archive) in recipe.archives().iter().enumerate() {
            plans.push(self.plan_download(archive, workspace, index)?);
        }

        let specs: Vec<FileSpec> = plans.iter().map(|p| p.spec.clone()).collect();
        let reports = self.run_job(specs)?;

        let mut sources = Vec::new();
        for (plan, report) in plans.iter().zip(&reports) {
            sources.push(check_and_describe(plan.archive, &plan.spec, report)?);
        }
        self.store
            .add_multiple_archives(&sources, &implementation.digest, &*self.handler)?;
        Ok(())
    }

    /// Decide how one archive travels over the wire.
    ///
    /// With a self-extracting offset and a range-capable server, only the
    /// archive bytes are requested; otherwise the whole resource is
    /// downloaded and the offset skipped at extraction. Range support
    /// also enables pause/resume for the transfer.
    fn plan_download<'a>(
        &self,
        archive: &'a Archive,
        workspace: &TempDir,
        index: usize,
    ) -> Result<DownloadPlan<'a>, FetchError> {
        let dest = workspace.path().join(format!("part{}", index));
        let supports_range = match self.transfer.probe(&archive.url) {
            Ok((_, supports_range)) => supports_range,
            // HEAD support is optional; fall back to a full GET.
            Err(e) => {
                debug!(url = %archive.url, error = %e, "HEAD probe failed");
                false
            }
        };

        let ranged = archive.start_offset > 0 && supports_range;
        let expected = if ranged {
            archive.size
        } else {
            archive.size + archive.start_offset
        };
        let spec = FileSpec::new(&archive.url, dest)
            .with_expected_size(expected)
            .with_resume(supports_range)
            .with_range_start(if ranged { archive.start_offset } else { 0 });
        Ok(DownloadPlan { archive, spec })
    }

    fn run_job(&self, files: Vec<FileSpec>) -> Result<Vec<FileReport>, FetchError> {
        let urls: Vec<String> = files.iter().map(|f| f.url.clone()).collect();
        let job = self
            .scheduler
            .add_job(JobSpec::new(self.config.priority, files));
        match self.scheduler.wait_job(job).expect("job was just added") {
            JobResult::Completed(reports) => Ok(reports),
            JobResult::Failed { reason } => Err(FetchError::Network {
                url: urls.join(", "),
                reason,
            }),
            JobResult::Cancelled => Err(FetchError::Cancelled),
        }
    }

    /// Transient download directory beside the store.
    fn download_workspace(&self) -> Result<TempDir, FetchError> {
        let parent = self
            .store
            .root()
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.store.root().to_path_buf());
        Ok(tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(parent)?)
    }
}

/// Deterministic retrieval method selection.
///
/// Prefer the smallest declared single archive unless some recipe's total
/// declared size is strictly smaller; recipes tie-break by declaration
/// order.
fn select_method(implementation: &Implementation) -> Result<Method<'_>, FetchError> {
    let best_archive = implementation
        .archives
        .iter()
        .min_by_key(|a| (a.size, a.url.clone()));
    let best_recipe = implementation
        .recipes
        .iter()
        .min_by_key(|r| r.total_size());

    match (best_archive, best_recipe) {
        (Some(archive), Some(recipe)) if recipe.total_size() < archive.size => {
            Ok(Method::Recipe(recipe))
        }
        (Some(archive), _) => Ok(Method::Single(archive)),
        (None, Some(_)) => Ok(Method::Recipe(&implementation.recipes[0])),
        (None, None) => Err(FetchError::NoRetrievalMethod),
    }
}

/// Enforce the declared size and describe the downloaded file for the
/// store's extractor.
fn check_and_describe(
    archive: &Archive,
    spec: &FileSpec,
    report: &FileReport,
) -> Result<ArchiveSource, FetchError> {
    // When the ranged request was honoured the prefix never travelled;
    // otherwise the declared offset is still in front of the archive data.
    let (expected, remaining_offset) = if report.ranged && spec.range_start > 0 {
        (archive.size, 0)
    } else {
        (archive.size + archive.start_offset, archive.start_offset)
    };

    if report.bytes != expected {
        return Err(FetchError::SizeMismatch {
            expected,
            actual: report.bytes,
            url: archive.url.clone(),
        });
    }

    let mut source = ArchiveSource::new(&spec.dest, &archive.mime_type)
        .with_start_offset(remaining_offset);
    if let Some(sub_dir) = &archive.sub_dir {
        source = source.with_sub_dir(sub_dir.clone());
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ManifestDigest;
    use std::path::PathBuf;

    fn digest() -> ManifestDigest {
        ManifestDigest::from_string("sha256new=testdigesttestdigesttestdigest234567").unwrap()
    }

    fn report(bytes: u64, ranged: bool) -> FileReport {
        FileReport {
            url: "http://example.com/a.zip".to_string(),
            bytes,
            ranged,
        }
    }

    #[test]
    fn test_select_method_prefers_smallest_archive() {
        let implementation = Implementation::new(digest())
            .with_archive(Archive::new("http://example.com/big.zip", 500))
            .with_archive(Archive::new("http://example.com/small.zip", 100));

        match select_method(&implementation).unwrap() {
            Method::Single(archive) => assert_eq!(archive.url, "http://example.com/small.zip"),
            Method::Recipe(_) => panic!("expected single archive"),
        }
    }

    #[test]
    fn test_select_method_prefers_strictly_smaller_recipe() {
        let implementation = Implementation::new(digest())
            .with_archive(Archive::new("http://example.com/full.zip", 500))
            .with_recipe(Recipe::new(vec![
                Archive::new("http://example.com/p1.zip", 100),
                Archive::new("http://example.com/p2.zip", 100),
            ]));

        match select_method(&implementation).unwrap() {
            Method::Recipe(recipe) => assert_eq!(recipe.total_size(), 200),
            Method::Single(_) => panic!("expected recipe"),
        }
    }

    #[test]
    fn test_select_method_ties_go_to_archive() {
        let implementation = Implementation::new(digest())
            .with_archive(Archive::new("http://example.com/full.zip", 200))
            .with_recipe(Recipe::new(vec![Archive::new(
                "http://example.com/p1.zip",
                200,
            )]));

        assert!(matches!(
            select_method(&implementation).unwrap(),
            Method::Single(_)
        ));
    }

    #[test]
    fn test_select_method_no_method() {
        let implementation = Implementation::new(digest());
        assert!(matches!(
            select_method(&implementation).unwrap_err(),
            FetchError::NoRetrievalMethod
        ));
    }

    #[test]
    fn test_size_check_full_download_includes_offset() {
        let archive = Archive::new("http://example.com/a.zip", 100).with_start_offset(0x10);
        let spec = FileSpec::new(&archive.url, PathBuf::from("/tmp/part0"));

        // Full download: offset bytes travelled too, extractor skips them.
        let source = check_and_describe(&archive, &spec, &report(116, false)).unwrap();
        assert_eq!(source.start_offset, 0x10);

        let err = check_and_describe(&archive, &spec, &report(100, false)).unwrap_err();
        assert!(matches!(err, FetchError::SizeMismatch { expected: 116, .. }));
    }

    #[test]
    fn test_size_check_ranged_download_excludes_offset() {
        let archive = Archive::new("http://example.com/a.zip", 100).with_start_offset(0x10);
        let spec = FileSpec::new(&archive.url, PathBuf::from("/tmp/part0")).with_range_start(0x10);

        let source = check_and_describe(&archive, &spec, &report(100, true)).unwrap();
        assert_eq!(source.start_offset, 0);

        let err = check_and_describe(&archive, &spec, &report(116, true)).unwrap_err();
        assert!(matches!(err, FetchError::SizeMismatch { expected: 100, .. }));
    }
}
