//! Introspection and readlink option types.
//!
//! The textual forms here are wire vocabulary: external tooling parses
//! dump/info output by these exact names, so they must never be renamed.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString, IntoEnumIterator};

use crate::error::ParseError;

/// How a symlink target is normalized by `readlink`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReadlinkMode {
    /// Target exactly as stored in the image.
    Raw,
    /// Separators converted to the host's preferred separator.
    #[default]
    Preferred,
    /// Separators converted to `/`.
    Posix,
}

impl ReadlinkMode {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ParseError> {
        <Self as FromStr>::from_str(s).map_err(|_| ParseError::UnknownReadlinkMode(s.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadlinkMode::Raw => "raw",
            ReadlinkMode::Preferred => "preferred",
            ReadlinkMode::Posix => "posix",
        }
    }
}

impl fmt::Display for ReadlinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How deeply introspection may touch block content.
///
/// Ordered: `NoAccess < NoVerify < Unrestricted`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockAccessLevel {
    /// Section headers only; no payload is read or decompressed.
    NoAccess,
    /// Payloads may be decompressed, checksums are not verified.
    NoVerify,
    /// Payloads are decompressed and checksums verified.
    #[default]
    Unrestricted,
}

impl BlockAccessLevel {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ParseError> {
        <Self as FromStr>::from_str(s).map_err(|_| ParseError::UnknownAccessLevel(s.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockAccessLevel::NoAccess => "no_access",
            BlockAccessLevel::NoVerify => "no_verify",
            BlockAccessLevel::Unrestricted => "unrestricted",
        }
    }

    /// Block payloads may be read and decompressed.
    pub fn allows_read(&self) -> bool {
        *self >= BlockAccessLevel::NoVerify
    }

    /// Checksums may be verified.
    pub fn allows_verify(&self) -> bool {
        *self == BlockAccessLevel::Unrestricted
    }
}

impl fmt::Display for BlockAccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One class of introspection detail.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FsInfoFeature {
    Version,
    History,
    MetadataSummary,
    MetadataDetails,
    MetadataFullDump,
    FrozenAnalysis,
    FrozenLayout,
    DirectoryTree,
    SectionDetails,
    ChunkDetails,
}

impl FsInfoFeature {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ParseError> {
        <Self as FromStr>::from_str(s.trim()).map_err(|_| ParseError::UnknownFeature(s.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsInfoFeature::Version => "version",
            FsInfoFeature::History => "history",
            FsInfoFeature::MetadataSummary => "metadata_summary",
            FsInfoFeature::MetadataDetails => "metadata_details",
            FsInfoFeature::MetadataFullDump => "metadata_full_dump",
            FsInfoFeature::FrozenAnalysis => "frozen_analysis",
            FsInfoFeature::FrozenLayout => "frozen_layout",
            FsInfoFeature::DirectoryTree => "directory_tree",
            FsInfoFeature::SectionDetails => "section_details",
            FsInfoFeature::ChunkDetails => "chunk_details",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for FsInfoFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`FsInfoFeature`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FsInfoFeatures(u32);

impl FsInfoFeatures {
    /// Highest meaningful detail level for [`FsInfoFeatures::for_level`].
    pub const MAX_LEVEL: u32 = 6;

    pub fn new() -> Self {
        Self::default()
    }

    /// Every feature.
    pub fn all() -> Self {
        FsInfoFeature::iter().collect()
    }

    /// Cumulative feature set for a numeric detail level.
    pub fn for_level(level: u32) -> Self {
        use FsInfoFeature::*;

        let level = level.min(Self::MAX_LEVEL);
        let mut features = Self::new();
        if level >= 1 {
            features.insert(Version);
            features.insert(MetadataSummary);
            features.insert(History);
        }
        if level >= 2 {
            features.insert(FrozenAnalysis);
        }
        if level >= 3 {
            features.insert(MetadataDetails);
            features.insert(SectionDetails);
        }
        if level >= 4 {
            features.insert(DirectoryTree);
        }
        if level >= 5 {
            features.insert(FrozenLayout);
            features.insert(ChunkDetails);
        }
        if level >= 6 {
            features.insert(MetadataFullDump);
        }
        features
    }

    pub fn contains(&self, feature: FsInfoFeature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn insert(&mut self, feature: FsInfoFeature) {
        self.0 |= feature.bit();
    }

    pub fn remove(&mut self, feature: FsInfoFeature) {
        self.0 &= !feature.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Contained features in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = FsInfoFeature> + '_ {
        FsInfoFeature::iter().filter(|f| self.contains(*f))
    }
}

impl FromIterator<FsInfoFeature> for FsInfoFeatures {
    fn from_iter<I: IntoIterator<Item = FsInfoFeature>>(iter: I) -> Self {
        let mut features = Self::new();
        for f in iter {
            features.insert(f);
        }
        features
    }
}

impl From<FsInfoFeature> for FsInfoFeatures {
    fn from(feature: FsInfoFeature) -> Self {
        Self(feature.bit())
    }
}

impl BitOr for FsInfoFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<FsInfoFeature> for FsInfoFeatures {
    type Output = Self;

    fn bitor(self, rhs: FsInfoFeature) -> Self {
        Self(self.0 | rhs.bit())
    }
}

impl BitOrAssign<FsInfoFeature> for FsInfoFeatures {
    fn bitor_assign(&mut self, rhs: FsInfoFeature) {
        self.insert(rhs);
    }
}

impl FromStr for FsInfoFeatures {
    type Err = ParseError;

    /// Parse a comma separated list of feature names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(FsInfoFeature::from_str)
            .collect()
    }
}

impl fmt::Display for FsInfoFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(|f| f.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for FsInfoFeatures {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for FsInfoFeatures {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let features = Vec::<FsInfoFeature>::deserialize(deserializer)?;
        Ok(features.into_iter().collect())
    }
}

/// Options for `dump` and `info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfoOptions {
    pub features: FsInfoFeatures,
    pub block_access: BlockAccessLevel,
}

impl FsInfoOptions {
    /// Features for `level` with the given block access.
    pub fn for_level(level: u32, block_access: BlockAccessLevel) -> Self {
        Self {
            features: FsInfoFeatures::for_level(level),
            block_access,
        }
    }
}
