pub mod aggregate;
pub mod cache;
pub mod session;
pub mod sort;
pub mod tree;

pub use cache::ListingCache;
pub use session::{InMemoryScan, ScanEngine};
pub use sort::SortKey;
pub use tree::DirectoryTree;
