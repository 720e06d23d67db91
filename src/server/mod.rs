//! WebSocket transport for the scan engine.

pub mod routes;

pub use routes::{build_router, serve};
