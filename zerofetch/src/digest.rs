//! Implementation digests: algorithm-to-hash mappings and their strings.
//!
//! A digest string has the form `<prefix>=<encoded>` and doubles as the
//! on-disk name of an installed implementation. An implementation may be
//! announced under several algorithms at once; consumers pick the
//! strongest one they know.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::manifest::ManifestFormat;

/// Errors from digest-string parsing.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid digest string {0:?} (expected <algorithm>=<hash>)")]
    InvalidDigestString(String),

    #[error("unknown digest algorithm {0:?}")]
    UnknownAlgorithm(String),
}

/// Split a digest string into its format and encoded hash.
pub fn parse_digest_string(s: &str) -> Result<(ManifestFormat, &str), DigestError> {
    let (prefix, encoded) = s
        .split_once('=')
        .ok_or_else(|| DigestError::InvalidDigestString(s.to_string()))?;
    if encoded.is_empty() {
        return Err(DigestError::InvalidDigestString(s.to_string()));
    }
    let format = ManifestFormat::from_prefix(prefix)
        .ok_or_else(|| DigestError::UnknownAlgorithm(prefix.to_string()))?;
    Ok((format, encoded))
}

/// A mapping from digest algorithm to encoded hash.
///
/// The map orders algorithms weakest-to-strongest, so the last entry is
/// always the preferred one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDigest {
    entries: BTreeMap<ManifestFormat, String>,
}

impl ManifestDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct from a single digest string.
    pub fn from_string(s: &str) -> Result<Self, DigestError> {
        let mut digest = Self::new();
        digest.add_string(s)?;
        Ok(digest)
    }

    /// Add one `<prefix>=<encoded>` entry.
    pub fn add_string(&mut self, s: &str) -> Result<(), DigestError> {
        let (format, encoded) = parse_digest_string(s)?;
        self.entries.insert(format, encoded.to_string());
        Ok(())
    }

    /// Add an entry from already-split parts.
    pub fn insert(&mut self, format: ManifestFormat, encoded: impl Into<String>) {
        self.entries.insert(format, encoded.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The strongest algorithm present, with its encoded hash.
    pub fn best(&self) -> Option<(ManifestFormat, &str)> {
        self.entries
            .iter()
            .next_back()
            .map(|(format, encoded)| (*format, encoded.as_str()))
    }

    /// The full digest string for the strongest algorithm present.
    pub fn best_string(&self) -> Option<String> {
        self.best()
            .map(|(format, encoded)| format!("{}={}", format.prefix(), encoded))
    }

    /// Full digest strings, strongest first (store lookup order).
    pub fn strings_strongest_first(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .rev()
            .map(|(format, encoded)| format!("{}={}", format.prefix(), encoded))
    }

    /// Whether any entry matches the given full digest string.
    pub fn matches(&self, digest_string: &str) -> bool {
        self.strings_strongest_first().any(|s| s == digest_string)
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best_string() {
            Some(s) => f.write_str(&s),
            None => f.write_str("(no digest)"),
        }
    }
}
