//! Tar extraction, optionally gzip-compressed.
//!
//! Delegates entry handling to the `tar` crate, which restores mtimes,
//! permissions and symlinks itself; this wrapper adds the leading-offset
//! and sub-directory semantics shared by all extractors.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::progress::TaskHandler;

use super::offset::OffsetReader;
use super::{reroot, ExtractError, Extractor};

/// Extractor for `application/x-tar` and `application/x-compressed-tar`.
pub struct TarExtractor {
    source: PathBuf,
    start_offset: u64,
    destination: PathBuf,
    sub_dir: Option<String>,
    gzip: bool,
}

impl TarExtractor {
    pub fn new(source: &Path, start_offset: u64, destination: &Path, gzip: bool) -> Self {
        Self {
            source: source.to_path_buf(),
            start_offset,
            destination: destination.to_path_buf(),
            sub_dir: None,
            gzip,
        }
    }

    fn extract_entries<R: Read>(
        &self,
        reader: R,
        handler: &dyn TaskHandler,
    ) -> Result<(), ExtractError> {
        let mut archive = Archive::new(reader);
        archive.set_preserve_mtime(true);
        archive.set_preserve_permissions(true);

        for entry in archive.entries()? {
            if handler.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            let mut entry = entry?;
            let relative = entry
                .path()
                .map_err(|e| ExtractError::MalformedArchive {
                    reason: e.to_string(),
                })?
                .into_owned();

            let Some(rerooted) = reroot(&relative, self.sub_dir.as_deref()) else {
                continue;
            };
            let dest_path = self.destination.join(&rerooted);
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest_path)?;
        }
        debug!(
            source = %self.source.display(),
            dest = %self.destination.display(),
            "tar extraction complete"
        );
        Ok(())
    }
}

impl Extractor for TarExtractor {
    fn set_sub_dir(&mut self, sub_dir: &str) {
        self.sub_dir = Some(sub_dir.trim_matches('/').to_string());
    }

    fn start_offset(&self) -> u64 {
        self.start_offset
    }

    fn run(&mut self, handler: &dyn TaskHandler) -> Result<(), ExtractError> {
        let file = File::open(&self.source)?;
        let reader = OffsetReader::new(BufReader::new(file), self.start_offset)?;
        if self.gzip {
            self.extract_entries(GzDecoder::new(reader), handler)
        } else {
            self.extract_entries(reader, handler)
        }
    }
}
