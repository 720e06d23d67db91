pub mod entry;
pub mod event;

pub use entry::Entry;
pub use event::{ScanEvent, ScanRequest};
