//! Manifest format variants and their digest encodings.
//!
//! Four formats exist, one per digest algorithm. They fall into two
//! families:
//!
//! - The old family (`sha1`, `sha256`) encodes digests as lowercase hex and
//!   includes an mtime on directory lines.
//! - The new family (`sha1new`, `sha256new`) encodes digests as lowercase
//!   unpadded base32 and emits directory lines without an mtime.
//!
//! The format is part of the wire contract: the same tree serialized under
//! different formats produces different manifest bytes and different digest
//! strings.

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Alphabet for the base32 digest encoding (RFC 4648, lowercased).
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A manifest format, named by its digest algorithm.
///
/// Ordered by algorithm strength: `Sha256New` is the strongest and the
/// preferred format for new installs, `Sha1` the weakest (kept for reading
/// existing stores).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManifestFormat {
    Sha1,
    Sha1New,
    Sha256,
    Sha256New,
}

impl ManifestFormat {
    /// All formats, weakest first.
    pub const ALL: [ManifestFormat; 4] = [
        ManifestFormat::Sha1,
        ManifestFormat::Sha1New,
        ManifestFormat::Sha256,
        ManifestFormat::Sha256New,
    ];

    /// The textual prefix used in digest strings and store directory names.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha1New => "sha1new",
            Self::Sha256 => "sha256",
            Self::Sha256New => "sha256new",
        }
    }

    /// Look up a format by its digest-string prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "sha1" => Some(Self::Sha1),
            "sha1new" => Some(Self::Sha1New),
            "sha256" => Some(Self::Sha256),
            "sha256new" => Some(Self::Sha256New),
            _ => None,
        }
    }

    /// Relative strength of the underlying algorithm; higher is stronger.
    ///
    /// Used to pick the best algorithm out of a multi-algorithm digest:
    /// `sha256new > sha256 > sha1new > sha1`.
    pub fn strength(self) -> u8 {
        match self {
            Self::Sha1 => 0,
            Self::Sha1New => 1,
            Self::Sha256 => 2,
            Self::Sha256New => 3,
        }
    }

    /// Whether directory lines in this format carry an mtime field.
    ///
    /// A compatibility wart of the old family, preserved because the mtime
    /// contributes to digests of already-installed trees.
    pub fn dir_lines_include_mtime(self) -> bool {
        matches!(self, Self::Sha1 | Self::Sha256)
    }

    /// Hash arbitrary bytes, returning lowercase hex.
    ///
    /// Used for the per-line content hashes of files, executables and
    /// symlink targets; those are always hex regardless of family.
    pub fn hash_hex(self, data: &[u8]) -> String {
        match self {
            Self::Sha1 | Self::Sha1New => format!("{:x}", Sha1::digest(data)),
            Self::Sha256 | Self::Sha256New => format!("{:x}", Sha256::digest(data)),
        }
    }

    /// Create an incremental hasher for streaming file contents.
    pub fn hasher(self) -> FormatHasher {
        match self {
            Self::Sha1 | Self::Sha1New => FormatHasher::Sha1(Sha1::new()),
            Self::Sha256 | Self::Sha256New => FormatHasher::Sha256(Sha256::new()),
        }
    }

    /// Hash the full manifest bytes and encode per the family rules.
    ///
    /// Old family: lowercase hex. New family: lowercase unpadded base32.
    pub fn encode_digest(self, manifest_bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(manifest_bytes);
        let raw = hasher.finalize_raw();
        match self {
            Self::Sha1 | Self::Sha256 => hex_lower(&raw),
            Self::Sha1New | Self::Sha256New => base32_lower(&raw),
        }
    }

    /// Full digest string `<prefix>=<encoded>` for the given manifest bytes.
    pub fn digest_string(self, manifest_bytes: &[u8]) -> String {
        format!("{}={}", self.prefix(), self.encode_digest(manifest_bytes))
    }
}

impl std::fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Incremental hasher covering both algorithms behind one type.
pub enum FormatHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl FormatHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finish and return the raw digest bytes.
    pub fn finalize_raw(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }

    /// Finish and return lowercase hex.
    pub fn finalize_hex(self) -> String {
        hex_lower(&self.finalize_raw())
    }
}

fn hex_lower(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Lowercase base32 without padding.
///
/// Processes the input as a bit stream, emitting one character per 5 bits;
/// a final partial group is zero-padded on the right to 5 bits. No `=`
/// padding characters are appended.
fn base32_lower(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(BASE32_ALPHABET[index as usize] as char);
        }
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(BASE32_ALPHABET[index as usize] as char);
    }
    out
}
