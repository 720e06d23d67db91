pub mod fs;
pub mod scan;
