//! OS access capability.
//!
//! The reader touches the live filesystem only to load the image. That goes
//! through [`OsAccess`] so callers can substitute their own source.

use std::io;
use std::path::Path;
use std::sync::Arc;

/// Bytes of a loaded image, shared with the block engine.
pub type ImageBytes = Arc<[u8]>;

/// Live filesystem operations needed to mount an image.
pub trait OsAccess: Send + Sync {
    /// Load the complete contents of `path` into memory.
    ///
    /// The whole image stays resident for the lifetime of the mount, so
    /// memory use grows with image size. Implementations backed by a memory
    /// map can return the mapping's bytes instead.
    fn load_file(&self, path: &Path) -> io::Result<ImageBytes>;
}

/// [`OsAccess`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsAccessGeneric;

impl OsAccessGeneric {
    pub fn new() -> Self {
        Self
    }
}

/// Reads the file eagerly with `std::fs::read`.
impl OsAccess for OsAccessGeneric {
    fn load_file(&self, path: &Path) -> io::Result<ImageBytes> {
        let data = std::fs::read(path)?;
        Ok(data.into())
    }
}
