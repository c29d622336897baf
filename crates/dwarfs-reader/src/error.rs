//! Reader error types.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Reader error type.
///
/// Every variant names the operation that failed. Path resolution misses are
/// not errors: `find` and `opendir` return `None` for those.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// Path does not exist. Raised by `resolve` and `list_dir`.
    #[error("{op}: not found: {what}")]
    NotFound { op: &'static str, what: String },

    /// Expected a directory. Raised by `list_dir`.
    #[error("{op}: not a directory: inode {inode}")]
    NotADirectory { op: &'static str, inode: u32 },

    /// Expected a symbolic link.
    #[error("{op}: not a symbolic link: inode {inode}")]
    NotASymlink { op: &'static str, inode: u32 },

    /// Out-of-range inode, offset or an argument of the wrong kind.
    #[error("{op}: invalid argument: {detail}")]
    InvalidArgument { op: &'static str, detail: String },

    /// Handle or a view derived from it used after teardown.
    #[error("{op}: filesystem is closed")]
    Closed { op: &'static str },

    /// Storage or decompression failure.
    #[error("{op}: I/O failure on {what}: {source}")]
    Io {
        op: &'static str,
        what: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Image structure is inconsistent.
    #[error("{op}: corrupt image: {detail}")]
    Corrupt { op: &'static str, detail: String },
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(op: &'static str, what: impl Into<String>) -> Self {
        Self::NotFound {
            op,
            what: what.into(),
        }
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(op: &'static str, inode: u32) -> Self {
        Self::NotADirectory { op, inode }
    }

    /// Create a NotASymlink error.
    pub fn not_a_symlink(op: &'static str, inode: u32) -> Self {
        Self::NotASymlink { op, inode }
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(op: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            detail: detail.into(),
        }
    }

    /// Create a Closed error.
    pub fn closed(op: &'static str) -> Self {
        Self::Closed { op }
    }

    /// Create an Io error.
    pub fn io(op: &'static str, what: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            op,
            what: what.into(),
            source: Arc::new(source),
        }
    }

    /// Create a Corrupt error.
    pub fn corrupt(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            op,
            detail: detail.into(),
        }
    }

    /// Name of the operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            Self::NotFound { op, .. }
            | Self::NotADirectory { op, .. }
            | Self::NotASymlink { op, .. }
            | Self::InvalidArgument { op, .. }
            | Self::Closed { op }
            | Self::Io { op, .. }
            | Self::Corrupt { op, .. } => op,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Convert FsError to std::io::Error for compatibility.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match &e {
            FsError::NotFound { .. } => io::ErrorKind::NotFound,
            FsError::NotADirectory { .. } => io::ErrorKind::NotADirectory,
            FsError::NotASymlink { .. } | FsError::InvalidArgument { .. } => {
                io::ErrorKind::InvalidInput
            }
            FsError::Closed { .. } => io::ErrorKind::BrokenPipe,
            FsError::Io { source, .. } => source.kind(),
            FsError::Corrupt { .. } => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Reader result type.
pub type FsResult<T> = Result<T, FsError>;

/// Failure of a whole-tree walk.
///
/// A visitor's own error is carried through untouched.
#[derive(Debug, Error)]
pub enum WalkError<E> {
    /// The filesystem failed (e.g. closed mid-walk).
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The visitor returned an error; the walk stopped there.
    #[error("walk aborted by visitor: {0}")]
    VisitorAborted(E),
}

impl<E> WalkError<E> {
    /// The visitor's error, if that is what stopped the walk.
    pub fn into_visitor_error(self) -> Option<E> {
        match self {
            Self::VisitorAborted(e) => Some(e),
            Self::Fs(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let e = FsError::not_a_symlink("readlink", 7);
        assert_eq!(e.to_string(), "readlink: not a symbolic link: inode 7");
        assert_eq!(e.op(), "readlink");

        let e = FsError::io(
            "read",
            "block 3",
            io::Error::new(io::ErrorKind::UnexpectedEof, "short read"),
        );
        assert!(e.to_string().contains("block 3"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_io_error_kinds() {
        let io: io::Error = FsError::closed("read").into();
        assert_eq!(io.kind(), io::ErrorKind::BrokenPipe);

        let io: io::Error = FsError::invalid_argument("read", "inode 99").into();
        assert_eq!(io.kind(), io::ErrorKind::InvalidInput);

        let io: io::Error = FsError::io("read", "x", io::Error::other("boom")).into();
        assert_eq!(io.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_walk_error_carries_visitor_error() {
        let e: WalkError<&str> = WalkError::VisitorAborted("stop");
        assert_eq!(e.to_string(), "walk aborted by visitor: stop");
        assert_eq!(e.into_visitor_error(), Some("stop"));

        let e: WalkError<&str> = FsError::closed("walk").into();
        assert!(matches!(e, WalkError::Fs(FsError::Closed { op: "walk" })));
    }
}
