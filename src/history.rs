//! Image history: one JSON record per write or rewrite of the image.
//!
//! The `HISTORY` section payload is a JSON array; rewriting an image
//! appends a record instead of replacing the section, so the provenance
//! chain survives recompression.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Seconds since the epoch, UTC.
    pub timestamp: i64,
    pub tool_version: String,
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub records: Vec<HistoryRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record for the current run.
    pub fn append(&mut self, arguments: Vec<String>) {
        self.records.push(HistoryRecord {
            timestamp: Utc::now().timestamp(),
            tool_version: env!("CARGO_PKG_VERSION").to_owned(),
            arguments,
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::CorruptImage(format!("history serialization failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::CorruptImage(format!("bad history section: {e}")))
    }
}
