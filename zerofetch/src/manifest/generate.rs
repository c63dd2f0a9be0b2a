//! Deterministic serialization of a directory tree into manifest nodes.
//!
//! Traversal is depth-first. Every directory contributes its own `D` line
//! (the root as `/`), followed by its leaf entries in byte-wise name
//! order, followed by its subdirectories in byte-wise name order, each
//! recursing. Leaves precede subdirectories so every leaf line belongs to
//! the most recent directory line. The ordering is part of the wire
//! contract: the digest of the manifest is the identity of the tree.
//!
//! The top-level `.manifest`, `.xbit` and `.symlink` entries are metadata
//! written by the store and are excluded from traversal, so regenerating
//! the manifest of an installed tree reproduces the bytes it was installed
//! under.

use std::fs;
use std::io::Read;
use std::path::Path;

use super::format::ManifestFormat;
use super::node::ManifestNode;
use super::sidecar::{SidecarSet, SYMLINK_FILE, XBIT_FILE};
use super::{Manifest, ManifestError, MANIFEST_FILE};

/// Buffer size for hashing file contents (64 KiB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Serialize the tree rooted at `root` under the given format.
pub fn generate(root: &Path, format: ManifestFormat) -> Result<Manifest, ManifestError> {
    let xbit = SidecarSet::load(root, XBIT_FILE)?;
    let symlinks = SidecarSet::load(root, SYMLINK_FILE)?;
    let walker = Walker {
        root,
        format,
        xbit,
        symlinks,
    };

    let mut nodes = Vec::new();
    walker.walk_dir(root, "/", &mut nodes)?;
    Ok(Manifest::from_nodes(format, nodes))
}

struct Walker<'a> {
    root: &'a Path,
    format: ManifestFormat,
    #[cfg_attr(unix, allow(dead_code))]
    xbit: SidecarSet,
    #[cfg_attr(unix, allow(dead_code))]
    symlinks: SidecarSet,
}

impl Walker<'_> {
    fn walk_dir(
        &self,
        dir: &Path,
        full_path: &str,
        nodes: &mut Vec<ManifestNode>,
    ) -> Result<(), ManifestError> {
        if self.format.dir_lines_include_mtime() {
            let meta = fs::metadata(dir)?;
            nodes.push(ManifestNode::DirOld {
                mtime: mtime_secs(&meta),
                full_path: full_path.to_string(),
            });
        } else {
            nodes.push(ManifestNode::Dir {
                full_path: full_path.to_string(),
            });
        }

        let mut entries: Vec<(String, fs::DirEntry)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if dir == self.root && matches!(name.as_str(), MANIFEST_FILE | XBIT_FILE | SYMLINK_FILE)
            {
                continue;
            }
            entries.push((name, entry));
        }
        // Byte-wise (C locale) ordering, part of the digest contract.
        entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        // All leaf entries come before any subdirectory, so that a
        // streaming reader can attribute each leaf line to the most
        // recently seen directory line.
        let mut subdirs = Vec::new();
        for (name, entry) in entries {
            if name.contains('\n') {
                return Err(ManifestError::InvalidName(name));
            }
            let entry_full = if full_path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", full_path, name)
            };
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)?;

            if meta.file_type().is_dir() {
                subdirs.push((path, entry_full));
            } else if self.is_symlink(&meta, &entry_full) {
                nodes.push(self.symlink_node(&path, &meta, name)?);
            } else {
                nodes.push(self.file_node(&path, &meta, &entry_full, name)?);
            }
        }
        for (path, entry_full) in subdirs {
            self.walk_dir(&path, &entry_full, nodes)?;
        }
        Ok(())
    }

    fn file_node(
        &self,
        path: &Path,
        meta: &fs::Metadata,
        full_path: &str,
        name: String,
    ) -> Result<ManifestNode, ManifestError> {
        let hash = hash_file(path, self.format)?;
        let mtime = mtime_secs(meta);
        let size = meta.len();
        if self.is_executable(meta, full_path) {
            Ok(ManifestNode::Executable {
                hash,
                mtime,
                size,
                name,
            })
        } else {
            Ok(ManifestNode::File {
                hash,
                mtime,
                size,
                name,
            })
        }
    }

    /// Hash of a symlink is the hash of exactly the target bytes, no
    /// terminator; the size field is the target's byte length.
    fn symlink_node(
        &self,
        path: &Path,
        meta: &fs::Metadata,
        name: String,
    ) -> Result<ManifestNode, ManifestError> {
        let target = if meta.file_type().is_symlink() {
            link_target_bytes(path)?
        } else {
            // Non-Unix sidecar representation: the file body is the target.
            fs::read(path)?
        };
        Ok(ManifestNode::Symlink {
            hash: self.format.hash_hex(&target),
            size: target.len() as u64,
            name,
        })
    }

    #[cfg(unix)]
    fn is_executable(&self, meta: &fs::Metadata, _full_path: &str) -> bool {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o100 != 0
    }

    #[cfg(not(unix))]
    fn is_executable(&self, _meta: &fs::Metadata, full_path: &str) -> bool {
        self.xbit.contains(full_path)
    }

    #[cfg(unix)]
    fn is_symlink(&self, meta: &fs::Metadata, _full_path: &str) -> bool {
        meta.file_type().is_symlink()
    }

    #[cfg(not(unix))]
    fn is_symlink(&self, meta: &fs::Metadata, full_path: &str) -> bool {
        meta.file_type().is_symlink() || self.symlinks.contains(full_path)
    }
}

/// Streaming content hash of one file, lowercase hex.
fn hash_file(path: &Path, format: ManifestFormat) -> Result<String, ManifestError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = format.hasher();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(unix)]
fn link_target_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    use std::os::unix::ffi::OsStrExt;
    Ok(fs::read_link(path)?.as_os_str().as_bytes().to_vec())
}

#[cfg(not(unix))]
fn link_target_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    Ok(fs::read_link(path)?
        .to_string_lossy()
        .into_owned()
        .into_bytes())
}

#[cfg(unix)]
fn mtime_secs(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_secs(meta: &fs::Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}
