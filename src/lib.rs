//! dirsize - incremental directory size aggregation.
//!
//! Turns a directory hierarchy (an in-memory entry list or a live
//! filesystem walk) into per-directory sizes, streamed as
//! [`ScanEvent`]s in an order where every directory is finalized only
//! after all of its subdirectories.

pub mod core;
pub mod models;
pub mod server;
pub mod services;

pub use crate::core::config::{EngineConfig, Strategy};
pub use crate::core::errors::{Error, Result};
pub use models::{Entry, ScanEvent, ScanRequest};
pub use services::scan::{ListingCache, ScanEngine, SortKey};
