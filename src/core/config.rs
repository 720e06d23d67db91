use crate::core::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Outstanding read/stat operations allowed during a live walk by default.
pub const DEFAULT_LIVE_CONCURRENCY: usize = 64;

/// Directories finalized, or entries merged, between cooperative yields.
pub const DEFAULT_YIELD_EVERY_N: usize = 64;

/// How directory sizes are computed once the tree is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Sort directories by descending depth and sum in that order.
    #[default]
    DepthSorted,
    /// Kahn-style pass driven by per-directory pending subdirectory counts.
    DependencyCounted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DepthSorted => "depth",
            Strategy::DependencyCounted => "kahn",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "depth" | "depth-sorted" => Ok(Strategy::DepthSorted),
            "kahn" | "dependency-counted" => Ok(Strategy::DependencyCounted),
            other => Err(format!("unknown strategy '{other}' (expected 'depth' or 'kahn')")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `None` leaves I/O unbounded.
    pub concurrency_limit: Option<usize>,
    pub yield_every_n: usize,
    /// Display-side filter only. Aggregation never looks at it.
    pub size_filter_bytes: u64,
    /// `sizeProgress` for directories still waiting on subdirectories, in
    /// live walks and after each in-memory batch.
    pub emit_progress: bool,
    pub strategy: Strategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            yield_every_n: DEFAULT_YIELD_EVERY_N,
            size_filter_bytes: 0,
            emit_progress: true,
            strategy: Strategy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults for walking a real filesystem.
    pub fn live() -> Self {
        Self {
            concurrency_limit: Some(DEFAULT_LIVE_CONCURRENCY),
            strategy: Strategy::DependencyCounted,
            ..Self::default()
        }
    }

    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == Some(0) {
            return Err(Error::Config(
                "concurrency limit must be a positive integer".to_string(),
            ));
        }
        if self.yield_every_n == 0 {
            return Err(Error::Config("yield batch size must be at least 1".to_string()));
        }
        Ok(())
    }
}
