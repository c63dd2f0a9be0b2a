//! Manifest nodes and their line-oriented serialization.
//!
//! Each node serializes to exactly one LF-terminated line. Leaders:
//!
//! - `F <hash> <mtime> <size> <name>` for regular files
//! - `X <hash> <mtime> <size> <name>` for executable files
//! - `S <hash> <size> <name>` for symbolic links (target bytes are hashed)
//! - `D <full-path>` for directories in the new family
//! - `D <mtime> <full-path>` for directories in the old family
//!
//! Fields are separated by single ASCII spaces. Names may contain spaces;
//! parsers split only the fixed number of leading fields and take the
//! remainder as the name. Names must not contain `/` or newline.

/// One entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestNode {
    File {
        hash: String,
        mtime: i64,
        size: u64,
        name: String,
    },
    Executable {
        hash: String,
        mtime: i64,
        size: u64,
        name: String,
    },
    Symlink {
        hash: String,
        size: u64,
        name: String,
    },
    /// Directory in the new family: slash-rooted path, no mtime.
    Dir { full_path: String },
    /// Directory in the old family: the mtime contributes to the digest.
    DirOld { mtime: i64, full_path: String },
}

impl ManifestNode {
    /// The entry name (file name for leaves, full path for directories).
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Executable { name, .. } | Self::Symlink { name, .. } => {
                name
            }
            Self::Dir { full_path } | Self::DirOld { full_path, .. } => full_path,
        }
    }

    /// Serialize to a single line, without the trailing newline.
    pub fn serialize_line(&self) -> String {
        match self {
            Self::File {
                hash,
                mtime,
                size,
                name,
            } => format!("F {} {} {} {}", hash, mtime, size, name),
            Self::Executable {
                hash,
                mtime,
                size,
                name,
            } => format!("X {} {} {} {}", hash, mtime, size, name),
            Self::Symlink { hash, size, name } => format!("S {} {} {}", hash, size, name),
            Self::Dir { full_path } => format!("D {}", full_path),
            Self::DirOld { mtime, full_path } => format!("D {} {}", mtime, full_path),
        }
    }

    /// Parse a single line (no trailing newline).
    ///
    /// `dir_mtime` selects the directory-line shape and must match the
    /// manifest's format family.
    pub fn parse_line(line: &str, dir_mtime: bool) -> Result<Self, String> {
        let (leader, rest) = line
            .split_once(' ')
            .ok_or_else(|| format!("missing fields in {:?}", line))?;

        match leader {
            "F" | "X" => {
                let mut parts = rest.splitn(4, ' ');
                let hash = parts.next().ok_or("missing hash")?.to_string();
                let mtime = parse_int(parts.next().ok_or("missing mtime")?)?;
                let size = parse_size(parts.next().ok_or("missing size")?)?;
                let name = parts.next().ok_or("missing name")?;
                let name = valid_name(name)?;
                if leader == "F" {
                    Ok(Self::File {
                        hash,
                        mtime,
                        size,
                        name,
                    })
                } else {
                    Ok(Self::Executable {
                        hash,
                        mtime,
                        size,
                        name,
                    })
                }
            }
            "S" => {
                let mut parts = rest.splitn(3, ' ');
                let hash = parts.next().ok_or("missing hash")?.to_string();
                let size = parse_size(parts.next().ok_or("missing size")?)?;
                let name = valid_name(parts.next().ok_or("missing name")?)?;
                Ok(Self::Symlink { hash, size, name })
            }
            "D" => {
                if dir_mtime {
                    let (mtime, path) = rest
                        .split_once(' ')
                        .ok_or("directory line missing mtime or path")?;
                    Ok(Self::DirOld {
                        mtime: parse_int(mtime)?,
                        full_path: valid_path(path)?,
                    })
                } else {
                    Ok(Self::Dir {
                        full_path: valid_path(rest)?,
                    })
                }
            }
            other => Err(format!("unknown leader {:?}", other)),
        }
    }
}

fn parse_int(field: &str) -> Result<i64, String> {
    field
        .parse::<i64>()
        .map_err(|_| format!("invalid integer {:?}", field))
}

fn parse_size(field: &str) -> Result<u64, String> {
    field
        .parse::<u64>()
        .map_err(|_| format!("invalid size {:?}", field))
}

/// Validate an entry name: no `/`, no newline, non-empty.
pub fn valid_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.contains('/') || name.contains('\n') {
        return Err(format!("name {:?} contains '/' or newline", name));
    }
    Ok(name.to_string())
}

/// Validate a directory path: slash-rooted, no newline.
pub fn valid_path(path: &str) -> Result<String, String> {
    if !path.starts_with('/') {
        return Err(format!("directory path {:?} is not slash-rooted", path));
    }
    if path.contains('\n') {
        return Err(format!("directory path {:?} contains newline", path));
    }
    Ok(path.to_string())
}
