//! Canonical manifests: the byte-exact serialization of a directory tree.
//!
//! A manifest is an ordered sequence of nodes, one line each, whose
//! concatenated bytes hash to the implementation's digest. Generation
//! (`generate`) walks a tree deterministically; parsing (`Manifest::parse`)
//! reverses serialization exactly, so `parse(serialize(m)) == m` and a
//! saved manifest loads back byte-identical.
//!
//! Submodules:
//!
//! - [`format`]: the four format variants and their digest encodings
//! - [`node`]: node variants and per-line serialization
//! - [`generate`]: directory traversal
//! - [`sidecar`]: `.xbit` / `.symlink` attribute records

mod format;
mod generate;
mod node;
mod sidecar;

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

pub use format::{FormatHasher, ManifestFormat};
pub use generate::generate;
pub use node::ManifestNode;
pub use sidecar::{SidecarSet, SYMLINK_FILE, XBIT_FILE};

/// Name of the manifest file stored inside an installed implementation.
pub const MANIFEST_FILE: &str = ".manifest";

/// Errors from manifest generation, parsing and persistence.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A manifest line failed to parse.
    #[error("malformed manifest at line {line}: {reason}")]
    MalformedManifest { line: usize, reason: String },

    /// An on-disk entry has a name the format cannot represent.
    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An ordered tree serialization together with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    format: ManifestFormat,
    nodes: Vec<ManifestNode>,
}

impl Manifest {
    pub(crate) fn from_nodes(format: ManifestFormat, nodes: Vec<ManifestNode>) -> Self {
        Self { format, nodes }
    }

    pub fn format(&self) -> ManifestFormat {
        self.format
    }

    pub fn nodes(&self) -> &[ManifestNode] {
        &self.nodes
    }

    /// Serialize to the canonical LF-terminated text.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&node.serialize_line());
            out.push('\n');
        }
        out
    }

    /// Parse manifest text under a known format.
    pub fn parse(text: &str, format: ManifestFormat) -> Result<Self, ManifestError> {
        let dir_mtime = format.dir_lines_include_mtime();
        let mut nodes = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let node = ManifestNode::parse_line(line, dir_mtime).map_err(|reason| {
                ManifestError::MalformedManifest {
                    line: index + 1,
                    reason,
                }
            })?;
            nodes.push(node);
        }
        Ok(Self { format, nodes })
    }

    /// The digest string `<prefix>=<encoded>` of the serialized bytes.
    pub fn digest(&self) -> String {
        self.format.digest_string(self.serialize().as_bytes())
    }

    /// Write the manifest verbatim to `dir/.manifest`.
    pub fn save(&self, dir: &Path) -> Result<(), ManifestError> {
        fs::write(dir.join(MANIFEST_FILE), self.serialize())?;
        Ok(())
    }

    /// Load and parse `dir/.manifest` under a known format.
    pub fn load(dir: &Path, format: ManifestFormat) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Self::parse(&text, format)
    }
}
