//! Write protection for installed implementations.
//!
//! Installed trees are immutable; protection makes accidental mutation
//! fail loudly. On Unix this is a recursive chmod (0555 for directories
//! and executables, 0444 for files); elsewhere the read-only attribute
//! is set recursively on files and directories. The NT mechanism pairs
//! that attribute with an ACL deny entry; no ACL is installed here, so
//! on those platforms the attribute is the whole defence. Symlinks are
//! left untouched.

use std::fs;
use std::io;
use std::path::Path;

/// Recursively make `path` read-only.
pub fn protect(path: &Path) -> io::Result<()> {
    walk(path, &set_read_only)
}

/// Recursively restore write permission under `path`.
pub fn unprotect(path: &Path) -> io::Result<()> {
    // Parents must become writable before their children can be touched.
    set_writable(path)?;
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let child = entry.path();
            if entry.file_type()?.is_dir() {
                unprotect(&child)?;
            } else if !entry.file_type()?.is_symlink() {
                set_writable(&child)?;
            }
        }
    }
    Ok(())
}

fn walk(path: &Path, apply: &dyn Fn(&Path) -> io::Result<()>) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.file_type().is_dir() {
        for entry in fs::read_dir(path)? {
            walk(&entry?.path(), apply)?;
        }
    }
    apply(path)
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::symlink_metadata(path)?;
    let mode = meta.permissions().mode();
    let new_mode = if meta.is_dir() || mode & 0o111 != 0 {
        0o555
    } else {
        0o444
    };
    fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
}

#[cfg(unix)]
fn set_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::symlink_metadata(path)?;
    let mode = meta.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::symlink_metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_writable(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let mut perms = meta.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}
