//! Parse errors for the textual forms of option enums.

use thiserror::Error;

/// Failure to parse one of the verbatim enum vocabularies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Unknown `fsinfo` feature name.
    #[error("unknown fsinfo feature: {0}")]
    UnknownFeature(String),

    /// Unknown block access level.
    #[error("unknown block access level: {0}")]
    UnknownAccessLevel(String),

    /// Unknown readlink mode.
    #[error("unknown readlink mode: {0}")]
    UnknownReadlinkMode(String),
}
