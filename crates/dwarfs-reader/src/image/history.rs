//! Build provenance stored in the HISTORY section.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// One run of the image builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub libdwarfs_version: String,
    pub system_id: String,
    pub arguments: Vec<String>,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| FsError::corrupt("mount", format!("history: {e}")))
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| FsError::corrupt("history", e.to_string()))
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Array of `{libdwarfs_version, system_id, arguments, timestamp}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Null)
    }

    /// Human-readable listing, one block per entry.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, e) in self.entries.iter().enumerate() {
            let _ = writeln!(out, "  {}. libdwarfs {} on {}", i + 1, e.libdwarfs_version, e.system_id);
            if !e.arguments.is_empty() {
                let _ = writeln!(out, "     args: {}", e.arguments.join(" "));
            }
            if let Some(ts) = e.timestamp {
                let _ = writeln!(out, "     time: {}", format_timestamp(ts));
            }
        }
        out
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub(crate) fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}
