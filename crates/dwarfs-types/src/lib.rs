//! Shared value types for reading DwarFS images.
//!
//! Everything in here is plain data: POSIX-style stat records, file type
//! enumeration, and the option sets that drive image introspection. The
//! reader crate builds these from image metadata; tooling consumes them.
//!
//! - [`FileStat`] / [`VfsStat`] mirror `stat(2)` / `statvfs(3)`.
//! - [`PosixFileType`] is the `S_IFMT` portion of a mode.
//! - [`FsInfoOptions`] selects which [`FsInfoFeature`]s a dump/info call
//!   includes and how far it may touch block content ([`BlockAccessLevel`]).

mod error;
mod options;
mod stat;

pub use error::ParseError;
pub use options::{BlockAccessLevel, FsInfoFeature, FsInfoFeatures, FsInfoOptions, ReadlinkMode};
pub use stat::{FileStat, PosixFileType, VfsStat, mode_string, perm_string};
