pub mod listing;
pub mod path;
pub mod walker;

pub use listing::{DirChild, FsBackend, LocalFs};
pub use walker::LiveWalker;
