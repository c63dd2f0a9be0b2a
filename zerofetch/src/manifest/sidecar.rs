//! Sidecar files recording attributes the filesystem cannot carry.
//!
//! On platforms without Unix permissions, executability and symlink-ness
//! are recorded in `.xbit` and `.symlink` files at the implementation
//! root: one slash-rooted path per line, LF-terminated, byte-wise sorted.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

/// Name of the executable-bit sidecar.
pub const XBIT_FILE: &str = ".xbit";

/// Name of the symlink sidecar.
pub const SYMLINK_FILE: &str = ".symlink";

/// A set of slash-rooted paths backed by one sidecar file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarSet {
    paths: BTreeSet<String>,
}

impl SidecarSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a sidecar from the implementation root.
    ///
    /// A missing sidecar file is an empty set, not an error.
    pub fn load(root: &Path, file_name: &str) -> io::Result<Self> {
        let path = root.join(file_name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let paths = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self { paths })
    }

    /// Write the sidecar into the implementation root.
    ///
    /// An empty set removes any existing sidecar file instead of leaving
    /// a zero-length one behind.
    pub fn save(&self, root: &Path, file_name: &str) -> io::Result<()> {
        let path = root.join(file_name);
        if self.paths.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            return Ok(());
        }
        let mut text = String::new();
        for entry in &self.paths {
            text.push_str(entry);
            text.push('\n');
        }
        fs::write(&path, text)
    }

    pub fn contains(&self, full_path: &str) -> bool {
        self.paths.contains(full_path)
    }

    pub fn insert(&mut self, full_path: String) {
        debug_assert!(full_path.starts_with('/'));
        self.paths.insert(full_path);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}
