//! ZIP extraction (PKZIP, store and deflate).
//!
//! Entry mtimes are restored to 1-second precision. Unix mode bits in the
//! external attributes are honoured: the user-execute bit marks the file
//! executable, `S_IFLNK` marks it a symbolic link whose contents are the
//! link target.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;
use zip::ZipArchive;

use crate::manifest::{SidecarSet, SYMLINK_FILE, XBIT_FILE};
use crate::progress::TaskHandler;

use super::offset::OffsetReader;
use super::{reroot, ExtractError, Extractor};

/// Unix file-type mask and symlink type in external attributes.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extractor for `application/zip`.
pub struct ZipExtractor {
    source: PathBuf,
    start_offset: u64,
    destination: PathBuf,
    sub_dir: Option<String>,
}

impl ZipExtractor {
    pub fn new(source: &Path, start_offset: u64, destination: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            start_offset,
            destination: destination.to_path_buf(),
            sub_dir: None,
        }
    }

    fn extract_all(&self, handler: &dyn TaskHandler) -> Result<(), ExtractError> {
        let file = File::open(&self.source)?;
        let reader = OffsetReader::new(BufReader::new(file), self.start_offset)?;
        let mut archive = ZipArchive::new(reader).map_err(|e| ExtractError::MalformedArchive {
            reason: e.to_string(),
        })?;

        let mut xbit = SidecarSet::new();
        let mut symlinks = SidecarSet::new();

        for index in 0..archive.len() {
            if handler.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            let mut entry =
                archive
                    .by_index(index)
                    .map_err(|e| ExtractError::MalformedArchive {
                        reason: e.to_string(),
                    })?;
            let relative = entry
                .enclosed_name()
                .ok_or_else(|| ExtractError::MalformedArchive {
                    reason: format!("unsafe entry name {:?}", entry.name()),
                })?;

            let Some(rerooted) = reroot(&relative, self.sub_dir.as_deref()) else {
                continue;
            };
            let dest_path = self.destination.join(&rerooted);

            if entry.is_dir() {
                fs::create_dir_all(&dest_path)?;
                continue;
            }

            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mode = entry.unix_mode();
            if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                let mut target = String::new();
                entry.read_to_string(&mut target)?;
                write_symlink(&dest_path, &target, &rerooted, &mut symlinks)?;
                continue;
            }

            let mtime = entry.last_modified().and_then(datetime_to_unix);
            let executable = mode.is_some_and(|m| m & 0o100 != 0);
            write_file(&mut entry, &dest_path, mtime, executable, &rerooted, &mut xbit)?;
        }

        xbit.save(&self.destination, XBIT_FILE)?;
        symlinks.save(&self.destination, SYMLINK_FILE)?;
        debug!(
            source = %self.source.display(),
            dest = %self.destination.display(),
            "zip extraction complete"
        );
        Ok(())
    }
}

impl Extractor for ZipExtractor {
    fn set_sub_dir(&mut self, sub_dir: &str) {
        self.sub_dir = Some(sub_dir.trim_matches('/').to_string());
    }

    fn start_offset(&self) -> u64 {
        self.start_offset
    }

    fn run(&mut self, handler: &dyn TaskHandler) -> Result<(), ExtractError> {
        // The archive handle (and with it the input file) drops before we
        // return, error or not.
        self.extract_all(handler)
    }
}

fn write_file<R: Read>(
    entry: &mut R,
    dest_path: &Path,
    mtime: Option<i64>,
    executable: bool,
    rerooted: &Path,
    xbit: &mut SidecarSet,
) -> Result<(), ExtractError> {
    let mut out = File::create(dest_path)?;
    io::copy(entry, &mut out)?;

    #[cfg(unix)]
    {
        let _ = (rerooted, &xbit);
        if executable {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = out.metadata()?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            out.set_permissions(perms)?;
        }
    }
    #[cfg(not(unix))]
    if executable {
        xbit.insert(rooted(rerooted));
    }

    if let Some(secs) = mtime {
        if secs >= 0 {
            out.set_modified(UNIX_EPOCH + Duration::from_secs(secs as u64))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(
    dest_path: &Path,
    target: &str,
    _rerooted: &Path,
    _symlinks: &mut SidecarSet,
) -> io::Result<()> {
    match fs::symlink_metadata(dest_path) {
        Ok(_) => fs::remove_file(dest_path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, dest_path)
}

#[cfg(not(unix))]
fn write_symlink(
    dest_path: &Path,
    target: &str,
    rerooted: &Path,
    symlinks: &mut SidecarSet,
) -> io::Result<()> {
    fs::write(dest_path, target)?;
    symlinks.insert(rooted(rerooted));
    Ok(())
}

/// Slash-rooted sidecar path for a destination-relative entry path.
#[cfg_attr(unix, allow(dead_code))]
fn rooted(relative: &Path) -> String {
    let mut out = String::from("/");
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    out.push_str(&parts.join("/"));
    out
}

/// Convert a ZIP (DOS) timestamp to Unix seconds.
fn datetime_to_unix(dt: zip::DateTime) -> Option<i64> {
    let days = days_from_civil(i64::from(dt.year()), i64::from(dt.month()), i64::from(dt.day()));
    Some(
        days * 86_400
            + i64::from(dt.hour()) * 3_600
            + i64::from(dt.minute()) * 60
            + i64::from(dt.second()),
    )
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
