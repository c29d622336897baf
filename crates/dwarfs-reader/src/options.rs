//! Mount-time reader options.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Where the first section starts inside the image file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawImageOffset", into = "RawImageOffset")]
pub enum ImageOffset {
    /// Scan for the first valid section header.
    #[default]
    Auto,
    /// Fixed byte offset.
    Fixed(u64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawImageOffset {
    Offset(u64),
    Word(String),
}

impl TryFrom<RawImageOffset> for ImageOffset {
    type Error = String;

    fn try_from(raw: RawImageOffset) -> Result<Self, Self::Error> {
        match raw {
            RawImageOffset::Offset(n) => Ok(ImageOffset::Fixed(n)),
            RawImageOffset::Word(w) => w.parse(),
        }
    }
}

impl From<ImageOffset> for RawImageOffset {
    fn from(offset: ImageOffset) -> Self {
        match offset {
            ImageOffset::Auto => RawImageOffset::Word("auto".to_string()),
            ImageOffset::Fixed(n) => RawImageOffset::Offset(n),
        }
    }
}

impl FromStr for ImageOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ImageOffset::Auto);
        }
        s.parse::<u64>()
            .map(ImageOffset::Fixed)
            .map_err(|_| format!("invalid image offset: {s} (expected 'auto' or a byte offset)"))
    }
}

impl fmt::Display for ImageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageOffset::Auto => f.write_str("auto"),
            ImageOffset::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Options applied when mounting an image.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// image_offset = "auto"
/// worker_threads = 4
/// max_cached_blocks = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemOptions {
    pub image_offset: ImageOffset,
    /// Threads serving `readv` block fetches.
    pub worker_threads: usize,
    /// Decompressed blocks kept in memory.
    pub max_cached_blocks: usize,
    /// Added to inode numbers reported as `ino` by `getattr`.
    pub inode_offset: u64,
    /// Count hard links at mount; otherwise every `nlink` is 1.
    pub enable_nlink: bool,
    /// Run structural metadata checks at mount.
    pub check_consistency: bool,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            image_offset: ImageOffset::Auto,
            worker_threads: 2,
            max_cached_blocks: 16,
            inode_offset: 0,
            enable_nlink: true,
            check_consistency: true,
        }
    }
}

impl FilesystemOptions {
    /// Parse options from TOML text.
    pub fn from_toml_str(s: &str) -> FsResult<Self> {
        toml::from_str(s).map_err(|e| FsError::invalid_argument("options", e.to_string()))
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FsError::io("options", path.display().to_string(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn with_image_offset(mut self, offset: ImageOffset) -> Self {
        self.image_offset = offset;
        self
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    pub fn with_max_cached_blocks(mut self, n: usize) -> Self {
        self.max_cached_blocks = n;
        self
    }

    pub fn with_inode_offset(mut self, offset: u64) -> Self {
        self.inode_offset = offset;
        self
    }

    pub fn with_enable_nlink(mut self, enable: bool) -> Self {
        self.enable_nlink = enable;
        self
    }

    pub fn with_check_consistency(mut self, check: bool) -> Self {
        self.check_consistency = check;
        self
    }

    /// Worker count clamped to at least one.
    pub(crate) fn effective_workers(&self) -> usize {
        self.worker_threads.max(1)
    }
}
