//! Format-dispatching archive extraction.
//!
//! An [`Extractor`] streams one archive into a destination directory,
//! restoring entry mtimes and recording executable bits and symlinks
//! (natively on Unix, via the `.xbit` / `.symlink` sidecars elsewhere).
//! Extractors are built by [`create_extractor`], keyed by MIME type:
//!
//! - `application/zip` is handled by [`ZipExtractor`]
//! - `application/x-tar` and `application/x-compressed-tar` by [`TarExtractor`]
//!
//! A `start_offset` skips leading non-archive bytes (self-extracting
//! installers); a sub-directory option restricts extraction to one archive
//! subtree, rerooted at the destination. Cleanup of a partially-written
//! destination is the caller's job.

mod offset;
mod tar;
mod zip;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::progress::TaskHandler;

pub use self::offset::OffsetReader;
pub use self::tar::TarExtractor;
pub use self::zip::ZipExtractor;

/// MIME type for ZIP archives.
pub const MIME_ZIP: &str = "application/zip";

/// MIME type for uncompressed tar archives.
pub const MIME_TAR: &str = "application/x-tar";

/// MIME type for gzip-compressed tar archives.
pub const MIME_TAR_GZ: &str = "application/x-compressed-tar";

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor available for MIME type {0:?}")]
    UnsupportedArchiveType(String),

    #[error("malformed archive: {reason}")]
    MalformedArchive { reason: String },

    #[error("extraction cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Capability to extract one archive into one destination directory.
pub trait Extractor: Send {
    /// Restrict extraction to entries under this archive-relative prefix,
    /// rerooting them at the destination.
    fn set_sub_dir(&mut self, sub_dir: &str);

    /// The configured leading-byte offset.
    fn start_offset(&self) -> u64;

    /// Run the extraction. The input is closed before returning, success
    /// or not.
    fn run(&mut self, handler: &dyn TaskHandler) -> Result<(), ExtractError>;
}

/// Build an extractor for the given MIME type.
pub fn create_extractor(
    mime: &str,
    source: &Path,
    start_offset: u64,
    destination: &Path,
) -> Result<Box<dyn Extractor>, ExtractError> {
    match mime {
        MIME_ZIP => Ok(Box::new(ZipExtractor::new(
            source,
            start_offset,
            destination,
        ))),
        MIME_TAR => Ok(Box::new(TarExtractor::new(
            source,
            start_offset,
            destination,
            false,
        ))),
        MIME_TAR_GZ => Ok(Box::new(TarExtractor::new(
            source,
            start_offset,
            destination,
            true,
        ))),
        other => Err(ExtractError::UnsupportedArchiveType(other.to_string())),
    }
}

/// Apply the sub-directory filter to an archive-relative path.
///
/// Returns the destination-relative path for entries that survive the
/// filter, `None` for entries outside the prefix (or the prefix itself).
pub(crate) fn reroot(relative: &Path, sub_dir: Option<&str>) -> Option<PathBuf> {
    match sub_dir {
        None => Some(relative.to_path_buf()),
        Some(prefix) => {
            let stripped = relative.strip_prefix(prefix).ok()?;
            if stripped.as_os_str().is_empty() {
                None
            } else {
                Some(stripped.to_path_buf())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_factory_dispatches_by_mime() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.zip");
        let dst = temp.path().join("out");

        assert!(create_extractor(MIME_ZIP, &src, 0, &dst).is_ok());
        assert!(create_extractor(MIME_TAR, &src, 0, &dst).is_ok());
        assert!(create_extractor(MIME_TAR_GZ, &src, 0, &dst).is_ok());
    }

    #[test]
    fn test_factory_rejects_unknown_mime() {
        let temp = TempDir::new().unwrap();
        let result = create_extractor(
            "application/x-rpm",
            &temp.path().join("a.rpm"),
            0,
            temp.path(),
        );
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected create_extractor to fail"),
        };
        assert!(matches!(err, ExtractError::UnsupportedArchiveType(_)));
    }

    #[test]
    fn test_factory_passes_offset_through() {
        let temp = TempDir::new().unwrap();
        let extractor =
            create_extractor(MIME_ZIP, &temp.path().join("a.zip"), 0x1000, temp.path()).unwrap();
        assert_eq!(extractor.start_offset(), 0x1000);
    }

    #[test]
    fn test_reroot_without_sub_dir() {
        let path = Path::new("dir/file.txt");
        assert_eq!(reroot(path, None).unwrap(), PathBuf::from("dir/file.txt"));
    }

    #[test]
    fn test_reroot_filters_and_strips() {
        assert_eq!(
            reroot(Path::new("sub/inner/file"), Some("sub")).unwrap(),
            PathBuf::from("inner/file")
        );
        assert!(reroot(Path::new("other/file"), Some("sub")).is_none());
        assert!(reroot(Path::new("sub"), Some("sub")).is_none());
    }
}
