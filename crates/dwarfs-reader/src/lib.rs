//! # dwarfs-reader
//!
//! Read-only access to DwarFS images.
//!
//! A [`Filesystem`] is opened from an image file through an [`OsAccess`]
//! capability and a [`Logger`]. Once open it:
//! - Resolves paths and inode numbers to [`DirEntryRef`] / [`InodeRef`] views
//! - Lists directories through [`DirectoryView`]
//! - Walks the whole tree in namespace or data order
//! - Reads file content synchronously or as per-chunk [`BlockRangeFuture`]s
//! - Reports stat records, statvfs, build history and layout dumps
//!
//! Closing the handle (explicitly, through [`Filesystem::scoped`] or by
//! dropping it) makes every further call, including calls on views derived
//! from it, fail with [`FsError::Closed`].

pub mod engine;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod info;
pub mod logger;
pub mod options;
pub mod os_access;
pub mod perfmon;
pub mod view;
pub mod walk;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


pub use engine::{BlockRange, BlockRangeFuture};
pub use error::{FsError, FsResult, WalkError};
pub use filesystem::Filesystem;
pub use logger::{Level, LogPolicy, LogSink, Logger, StreamSink, TracingSink};
pub use options::{FilesystemOptions, ImageOffset};
pub use os_access::{ImageBytes, OsAccess, OsAccessGeneric};
pub use perfmon::{PerfCounter, PerfSection, PerfTimer, PerformanceMonitor};
pub use view::{DirEntryRef, DirIter, DirectoryView, InodeRef};

pub use dwarfs_types::{
    BlockAccessLevel, FileStat, FsInfoFeature, FsInfoFeatures, FsInfoOptions, ParseError,
    PosixFileType, ReadlinkMode, VfsStat,
};
