//! Implementation descriptions, as handed to the fetcher by feed parsers.
//!
//! These are plain in-memory values; the core never reads feed XML. An
//! implementation carries its expected digest and at least one retrieval
//! method: a direct archive, or a recipe layering several archives.

use crate::digest::ManifestDigest;
use crate::extract::MIME_ZIP;

/// A downloadable archive and its extraction options.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Absolute URL of the archive.
    pub url: String,
    /// MIME type selecting the extractor.
    pub mime_type: String,
    /// Declared size in bytes of the archive proper (excluding any
    /// self-extracting prefix).
    pub size: u64,
    /// Leading bytes to skip before archive data starts.
    pub start_offset: u64,
    /// Extract only this archive subtree, rerooted at the target.
    pub sub_dir: Option<String>,
}

impl Archive {
    pub fn new(url: impl Into<String>, size: u64) -> Self {
        Self {
            url: url.into(),
            mime_type: MIME_ZIP.to_string(),
            size,
            start_offset: 0,
            sub_dir: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
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

/// An ordered list of archives whose overlay produces the implementation.
///
/// Order is significant: later archives may create, overwrite, or add
/// files beside those of earlier ones.
#[derive(Debug, Clone)]
pub struct Recipe {
    archives: Vec<Archive>,
}

impl Recipe {
    /// # Panics
    ///
    /// A recipe must contain at least one archive.
    pub fn new(archives: Vec<Archive>) -> Self {
        assert!(!archives.is_empty(), "a recipe needs at least one archive");
        Self { archives }
    }

    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    /// Sum of the declared sizes of all parts.
    pub fn total_size(&self) -> u64 {
        self.archives.iter().map(|a| a.size).sum()
    }
}

/// A concrete implementation to fetch: digest plus retrieval methods.
#[derive(Debug, Clone)]
pub struct Implementation {
    pub digest: ManifestDigest,
    pub archives: Vec<Archive>,
    pub recipes: Vec<Recipe>,
}

impl Implementation {
    pub fn new(digest: ManifestDigest) -> Self {
        Self {
            digest,
            archives: Vec::new(),
            recipes: Vec::new(),
        }
    }

    pub fn with_archive(mut self, archive: Archive) -> Self {
        self.archives.push(archive);
        self
    }

    pub fn with_recipe(mut self, recipe: Recipe) -> Self {
        self.recipes.push(recipe);
        self
    }

    pub fn has_retrieval_method(&self) -> bool {
        !self.archives.is_empty() || !self.recipes.is_empty()
    }
}

/// One top-level fetch call: the set of implementations to make available.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub implementations: Vec<Implementation>,
}

impl FetchRequest {
    pub fn new(implementations: Vec<Implementation>) -> Self {
        Self { implementations }
    }

    pub fn single(implementation: Implementation) -> Self {
        Self {
            implementations: vec![implementation],
        }
    }
}
