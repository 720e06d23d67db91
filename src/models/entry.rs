use crate::services::fs::path::{name_of, normalize};
use humansize::{format_size as humanize, BINARY};
use serde::{Deserialize, Serialize};

/// One file or directory observed during a scan.
///
/// `size` is only trustworthy once `size_final` is set. Files are final from
/// the moment they are observed; directories start at zero and are finalized
/// by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub size_final: bool,
}

impl Entry {
    pub fn file(path: &str, size: u64) -> Self {
        let path = normalize(path);
        Self {
            name: name_of(&path).to_string(),
            path,
            is_directory: false,
            size,
            size_final: true,
        }
    }

    pub fn directory(path: &str) -> Self {
        let path = normalize(path);
        Self {
            name: name_of(&path).to_string(),
            path,
            is_directory: true,
            size: 0,
            size_final: false,
        }
    }

    /// Records a non-final observation. Sizes never move backwards and a
    /// finalized entry is left untouched.
    pub fn observe_size(&mut self, size: u64) -> bool {
        if self.size_final || size < self.size {
            return false;
        }
        self.size = size;
        true
    }

    /// Flips `size_final` exactly once. Later calls are ignored.
    pub fn finalize(&mut self, size: u64) -> bool {
        if self.size_final {
            return false;
        }
        self.size = size.max(self.size);
        self.size_final = true;
        true
    }

    /// Fraction of `parent_total` this entry accounts for, in `[0, 1]`.
    pub fn share_of(&self, parent_total: u64) -> f64 {
        if parent_total == 0 {
            return 0.0;
        }
        (self.size as f64 / parent_total as f64).clamp(0.0, 1.0)
    }

    pub fn display_size(&self) -> String {
        format_size(self.size)
    }
}

pub fn format_size(bytes: u64) -> String {
    humanize(bytes, BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_is_final_on_creation() {
        let entry = Entry::file("a\\b\\c.txt", 10);
        assert_eq!(entry.path, "a/b/c.txt");
        assert_eq!(entry.name, "c.txt");
        assert!(entry.size_final);
        assert_eq!(entry.size, 10);
    }

    #[test]
    fn directory_finalizes_once() {
        let mut dir = Entry::directory("a/b/");
        assert_eq!(dir.path, "a/b");
        assert!(!dir.size_final);

        assert!(dir.observe_size(4));
        assert!(!dir.observe_size(2), "sizes never shrink");
        assert!(dir.finalize(12));
        assert!(!dir.finalize(99));
        assert!(!dir.observe_size(100));
        assert_eq!(dir.size, 12);
    }

    #[test]
    fn share_of_handles_empty_parent() {
        let entry = Entry::file("x", 5);
        assert_eq!(entry.share_of(0), 0.0);
        assert!((entry.share_of(20) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn formats_with_binary_units() {
        assert!(format_size(0).ends_with(" B"));
        let two_kib = format_size(2048);
        assert!(two_kib.starts_with('2') && two_kib.ends_with("KiB"), "{two_kib}");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(Entry::file("a/x.txt", 3)).unwrap();
        assert_eq!(json["isDirectory"], false);
        assert_eq!(json["sizeFinal"], true);
        assert_eq!(json["name"], "x.txt");
    }
}
