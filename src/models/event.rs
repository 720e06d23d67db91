use super::entry::Entry;
use crate::core::config::Strategy;
use crate::services::scan::sort::SortKey;
use serde::{Deserialize, Serialize};

/// Everything the engine tells a consumer. Serializes as
/// `{"action": "<kind>", ...}` so any transport can relay it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ScanEvent {
    Init,
    Listing {
        path: String,
        children: Vec<Entry>,
    },
    SizeProgress {
        path: String,
        size: u64,
    },
    SizeFinal {
        path: String,
        size: u64,
    },
    #[serde(rename_all = "camelCase")]
    ScanComplete {
        total_entries: u64,
        elapsed_ms: u64,
        total_bytes: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        message: String,
    },
}

impl ScanEvent {
    pub fn entry_error(path: impl Into<String>, message: impl Into<String>) -> Self {
        ScanEvent::Error {
            path: Some(path.into()),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ScanEvent::Error {
            path: None,
            message: message.into(),
        }
    }

    /// Scan-level failures carry no path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanEvent::Error { path: None, .. })
    }
}

/// What a consumer may ask of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ScanRequest {
    #[serde(rename_all = "camelCase")]
    StartScan {
        root: String,
        #[serde(default)]
        concurrency_limit: Option<usize>,
    },
    /// In-memory scan of entries the consumer already holds.
    #[serde(rename_all = "camelCase")]
    ScanEntries {
        entries: Vec<Entry>,
        #[serde(default)]
        strategy: Option<Strategy>,
    },
    CancelScan,
    RequestListing {
        path: String,
        #[serde(default)]
        sort: Option<SortKey>,
    },
}
