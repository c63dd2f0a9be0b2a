//! The content-addressed implementation store.
//!
//! A store is a directory whose sub-directories are named by implementation
//! digest strings and whose contents match those digests. All mutation goes
//! through a staging discipline: trees are built in dot-prefixed temporary
//! directories (invisible to lookups), verified against their expected
//! digest, and committed with an atomic rename. Installed trees are
//! write-protected and never modified in place.
//!
//! Submodules:
//!
//! - [`install`]: the verify-and-install protocol
//! - [`protect`]: recursive write protection

mod install;
mod protect;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::digest::{parse_digest_string, DigestError, ManifestDigest};
use crate::extract::{create_extractor, ExtractError};
use crate::manifest::{self, Manifest, ManifestError, ManifestNode};
use crate::progress::TaskHandler;

pub use protect::{protect, unprotect};

/// Known mtime value used by the accuracy probe.
const PROBE_MTIME_SECS: u64 = 1_234_567_891;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The staged tree's digest does not match the expected digest.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        expected: String,
        actual: String,
        /// The manifest text that was computed over the staged tree.
        manifest: String,
    },

    /// The expected digest names no algorithm at all (caller bug).
    #[error("no known digest algorithm in expected digest")]
    NoKnownDigest,

    /// The implementation is already installed (install race or repeat).
    #[error("implementation {digest} is already in the store")]
    AlreadyInStore { digest: String },

    /// The backing filesystem cannot store mtimes to 1-second accuracy.
    #[error("store filesystem lacks 1-second mtime accuracy: {detail}")]
    InsufficientTimeAccuracy { detail: String },

    /// No algorithm of the digest names an installed implementation.
    #[error("implementation {digest} not found in the store")]
    ImplementationNotFound { digest: String },

    /// A mutating operation was attempted on a read-only store.
    #[error("store is read-only")]
    StoreReadOnly,

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A local archive awaiting extraction into the store.
///
/// `path` points at the downloaded bytes; `start_offset` and `sub_dir`
/// carry the extraction options declared alongside the archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    pub path: PathBuf,
    pub mime_type: String,
    pub start_offset: u64,
    pub sub_dir: Option<String>,
}

impl ArchiveSource {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            start_offset: 0,
            sub_dir: None,
        }
    }

    pub fn with_start_offset(mut self, start_offset: u64) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn with_sub_dir(mut self, sub_dir: impl Into<String>) -> Self {
        self.sub_dir = Some(sub_dir.into());
        self
    }
}

/// Outcome of a full-store verification pass.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<VerifyFailure>,
}

/// One implementation that failed verification.
#[derive(Debug)]
pub struct VerifyFailure {
    pub digest: String,
    pub detail: String,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of an optimise (deduplication) pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OptimiseReport {
    pub files_relinked: usize,
    pub bytes_saved: u64,
}

/// A content-addressed cache of installed implementations.
pub struct DirectoryStore {
    root: PathBuf,
    read_only: bool,
}

impl DirectoryStore {
    /// Open (creating if necessary) a store at `root`.
    ///
    /// Probes the backing filesystem for 1-second mtime accuracy; stores
    /// on coarser filesystems (e.g. FAT's 2-second timestamps) are
    /// rejected because manifest digests embed mtimes.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        probe_time_accuracy(&root)?;
        debug!(root = %root.display(), "store opened");
        Ok(Self {
            root,
            read_only: false,
        })
    }

    /// Open an existing store without probing or permitting mutation.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True iff some algorithm of `digest` names an installed tree.
    pub fn contains(&self, digest: &ManifestDigest) -> bool {
        digest
            .strings_strongest_first()
            .any(|name| self.root.join(name).is_dir())
    }

    /// Path of the first algorithm of `digest` that is installed.
    pub fn path(&self, digest: &ManifestDigest) -> Result<PathBuf, StoreError> {
        for name in digest.strings_strongest_first() {
            let candidate = self.root.join(&name);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Err(StoreError::ImplementationNotFound {
            digest: digest.to_string(),
        })
    }

    /// All installed digest strings, byte-wise sorted.
    ///
    /// Only names of the form `<prefix>=<rest>` count; dot-prefixed
    /// entries (staging directories, metadata) are skipped.
    pub fn list_all(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.contains('=') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Copy `source` into the store under `expected`.
    pub fn add_directory(
        &self,
        source: &Path,
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        let staging = self.begin_staging()?;
        copy_tree(source, staging.path())?;
        install::verify_and_install(&self.root, staging.into_path(), expected, handler)
    }

    /// Extract one archive into the store under `expected`.
    pub fn add_archive(
        &self,
        archive: &ArchiveSource,
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        self.add_multiple_archives(std::slice::from_ref(archive), expected, handler)
    }

    /// Extract several archives in order over one staging directory.
    ///
    /// Later archives overlay earlier ones: they may create new files,
    /// overwrite existing ones, or add files beside them.
    pub fn add_multiple_archives(
        &self,
        archives: &[ArchiveSource],
        expected: &ManifestDigest,
        handler: &dyn TaskHandler,
    ) -> Result<PathBuf, StoreError> {
        let staging = self.begin_staging()?;
        for archive in archives {
            let name = archive
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| archive.path.display().to_string());
            handler.starting_extraction(&name);

            let mut extractor = create_extractor(
                &archive.mime_type,
                &archive.path,
                archive.start_offset,
                staging.path(),
            )?;
            if let Some(sub_dir) = &archive.sub_dir {
                extractor.set_sub_dir(sub_dir);
            }
            extractor.run(handler)?;
        }
        install::verify_and_install(&self.root, staging.into_path(), expected, handler)
    }

    /// Remove an installed implementation.
    ///
    /// The tree is unprotected, renamed to a transient dot-prefixed name
    /// (the atomic commit of the removal), then deleted.
    pub fn remove(&self, digest: &ManifestDigest) -> Result<(), StoreError> {
        self.require_writable()?;
        let target = self.path(digest)?;

        protect::unprotect(&target)?;
        let graveyard = tempfile::Builder::new()
            .prefix(".removing-")
            .tempdir_in(&self.root)?;
        let parked = graveyard.path().join("impl");
        fs::rename(&target, &parked)?;
        graveyard.close()?;
        info!(digest = %digest, "implementation removed");
        Ok(())
    }

    /// Recompute the manifest of every installed implementation and
    /// compare it with the directory name.
    pub fn verify(&self, handler: &dyn TaskHandler) -> Result<VerifyReport, StoreError> {
        let mut report = VerifyReport::default();
        for name in self.list_all()? {
            if handler.is_cancelled() {
                break;
            }
            handler.starting_manifest(&name);
            report.checked += 1;
            match self.verify_one(&name) {
                Ok(()) => {}
                Err(detail) => report.failures.push(VerifyFailure {
                    digest: name,
                    detail,
                }),
            }
        }
        if !report.is_clean() {
            warn!(
                failures = report.failures.len(),
                checked = report.checked,
                "store verification found corrupt implementations"
            );
        }
        Ok(report)
    }

    fn verify_one(&self, name: &str) -> Result<(), String> {
        let (format, _) = parse_digest_string(name).map_err(|e| e.to_string())?;
        let manifest =
            manifest::generate(&self.root.join(name), format).map_err(|e| e.to_string())?;
        let actual = manifest.digest();
        if actual == name {
            Ok(())
        } else {
            Err(format!("recomputed digest is {actual}"))
        }
    }

    /// Deduplicate identical files across implementations via hard links.
    ///
    /// Two files are identical when their manifest entries agree on kind,
    /// content hash, mtime and size; the first occurrence becomes the
    /// canonical inode and later ones are relinked to it.
    pub fn optimise(&self, handler: &dyn TaskHandler) -> Result<OptimiseReport, StoreError> {
        self.require_writable()?;
        let mut report = OptimiseReport::default();
        let mut seen: HashMap<(char, String, i64, u64), PathBuf> = HashMap::new();

        for name in self.list_all()? {
            if handler.is_cancelled() {
                break;
            }
            let impl_root = self.root.join(&name);
            let (format, _) = parse_digest_string(&name)?;
            let manifest = match Manifest::load(&impl_root, format) {
                Ok(m) => m,
                Err(e) => {
                    warn!(digest = %name, error = %e, "skipping implementation without readable manifest");
                    continue;
                }
            };

            for (relative, kind, hash, mtime, size) in leaf_files(&manifest) {
                let path = impl_root.join(&relative);
                let key = (kind, hash, mtime, size);
                match seen.get(&key).cloned() {
                    None => {
                        seen.insert(key, path);
                    }
                    Some(canonical) if same_inode(&canonical, &path)? => {}
                    Some(canonical) => {
                        relink(&canonical, &path)?;
                        report.files_relinked += 1;
                        report.bytes_saved += size;
                    }
                }
            }
        }
        info!(
            files = report.files_relinked,
            bytes = report.bytes_saved,
            "store optimise complete"
        );
        Ok(report)
    }

    fn begin_staging(&self) -> Result<TempDir, StoreError> {
        self.require_writable()?;
        Ok(tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?)
    }

    fn require_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::StoreReadOnly)
        } else {
            Ok(())
        }
    }
}

/// Regular and executable file entries of a manifest, with their paths
/// relative to the implementation root.
fn leaf_files(manifest: &Manifest) -> Vec<(PathBuf, char, String, i64, u64)> {
    let mut out = Vec::new();
    let mut current_dir = PathBuf::new();
    for node in manifest.nodes() {
        match node {
            ManifestNode::Dir { full_path } | ManifestNode::DirOld { full_path, .. } => {
                current_dir = PathBuf::from(full_path.trim_start_matches('/'));
            }
            ManifestNode::File {
                hash,
                mtime,
                size,
                name,
            } => out.push((current_dir.join(name), 'F', hash.clone(), *mtime, *size)),
            ManifestNode::Executable {
                hash,
                mtime,
                size,
                name,
            } => out.push((current_dir.join(name), 'X', hash.clone(), *mtime, *size)),
            ManifestNode::Symlink { .. } => {}
        }
    }
    out
}

#[cfg(unix)]
fn same_inode(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let ma = fs::metadata(a)?;
    let mb = fs::metadata(b)?;
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

#[cfg(not(unix))]
fn same_inode(_a: &Path, _b: &Path) -> io::Result<bool> {
    // No portable inode identity; relink unconditionally.
    Ok(false)
}

/// Replace `duplicate` with a hard link to `canonical`.
///
/// The link is created under a temporary name and renamed over the
/// duplicate, so a crash never leaves the file missing. The parent
/// directory is made writable for the swap and re-protected afterwards.
fn relink(canonical: &Path, duplicate: &Path) -> io::Result<()> {
    let parent = duplicate
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no parent"))?;

    #[cfg(unix)]
    let saved_mode = {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(parent)?.permissions().mode();
        fs::set_permissions(parent, fs::Permissions::from_mode(mode | 0o700))?;
        mode
    };

    let temp_name = parent.join(".optimise-link");
    let result = (|| {
        match fs::remove_file(&temp_name) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::hard_link(canonical, &temp_name)?;
        fs::rename(&temp_name, duplicate)
    })();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(saved_mode));
    }

    result
}

/// Recursively copy a tree, preserving permissions, symlinks and mtimes.
///
/// Manifest digests embed mtimes, so a plain copy would change the
/// identity of the tree.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;

        if meta.file_type().is_symlink() {
            copy_symlink(&from, &to)?;
        } else if meta.is_dir() {
            fs::create_dir(&to)?;
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
            // The copied mode may be read-only; setting times needs only
            // ownership, not a write handle.
            let out = File::open(&to)?;
            out.set_modified(meta.modified()?)?;
        }
    }
    // Directory mtimes matter to the old format family; restore after the
    // children stop touching the directory. Best effort.
    if let Ok(meta) = fs::metadata(source) {
        if let Ok(dir) = File::open(dest) {
            let _ = meta.modified().and_then(|t| dir.set_modified(t));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    // Degrade to copying the referent; sidecars carry symlink-ness on
    // these platforms.
    fs::copy(from, to).map(|_| ())
}

/// Check that the filesystem at `root` stores mtimes to 1-second accuracy.
fn probe_time_accuracy(root: &Path) -> Result<(), StoreError> {
    let probe_path = root.join(".mtime-probe");
    let probe = File::create(&probe_path)?;
    probe.set_modified(UNIX_EPOCH + Duration::from_secs(PROBE_MTIME_SECS))?;
    drop(probe);

    let observed = fs::metadata(&probe_path)?.modified()?;
    let _ = fs::remove_file(&probe_path);

    let observed_secs = observed
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if observed_secs != PROBE_MTIME_SECS {
        return Err(StoreError::InsufficientTimeAccuracy {
            detail: format!("set mtime {PROBE_MTIME_SECS}, read back {observed_secs}"),
        });
    }
    Ok(())
}
