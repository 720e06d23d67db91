//! Slash-separated path keys.
//!
//! Every path that enters the engine goes through [`normalize`] first, so the
//! tree, the cache and the emitted events all agree on one spelling. These
//! helpers are total: odd input degrades to the empty string instead of
//! failing.

use std::path::Path;

pub const SEPARATOR: char = '/';

/// Converts backslashes to `/` and strips a single trailing separator.
/// A lone `/` (filesystem root) is kept as is.
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut normalized = path.replace('\\', "/");
    if normalized.len() > 1 && normalized.ends_with(SEPARATOR) {
        normalized.pop();
    }
    normalized
}

pub fn normalize_path(path: &Path) -> String {
    normalize(&path.to_string_lossy())
}

/// Everything before the last separator, or `""` when there is none.
pub fn parent_of(path: &str) -> String {
    match path.rfind(SEPARATOR) {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Parent of `path` inside a scan rooted at `root`. Returns `None` for the
/// root itself; anything that would climb above the root maps to the root.
pub fn parent_within(path: &str, root: &str) -> Option<String> {
    if path == root {
        return None;
    }
    let parent = parent_of(path);
    if parent.len() < root.len() || parent.is_empty() {
        Some(root.to_string())
    } else {
        Some(parent)
    }
}

/// Last path segment.
pub fn name_of(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with(SEPARATOR) {
        format!("{dir}{name}")
    } else {
        format!("{dir}{SEPARATOR}{name}")
    }
}

/// Number of non-empty segments. The empty root has depth 0.
pub fn depth(path: &str) -> usize {
    path.split(SEPARATOR).filter(|s| !s.is_empty()).count()
}

/// Every proper ancestor of `path`, nearest first, stopping before `root`.
pub fn ancestors<'a>(path: &'a str, root: &'a str) -> impl Iterator<Item = String> + 'a {
    let mut current = path.to_string();
    std::iter::from_fn(move || {
        let parent = parent_within(&current, root)?;
        if parent == root {
            return None;
        }
        current = parent.clone();
        Some(parent)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_separators_and_trailing_slash() {
        assert_eq!(normalize("a\\b\\c"), "a/b/c");
        assert_eq!(normalize("a/b/"), "a/b");
        assert_eq!(normalize("a/b//"), "a/b/");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn parent_of_without_separator_is_root() {
        assert_eq!(parent_of("x.txt"), "");
        assert_eq!(parent_of("a/b/y.txt"), "a/b");
        assert_eq!(parent_of(""), "");
    }

    #[test]
    fn parent_within_declared_root() {
        assert_eq!(parent_within("/data/a", "/data").as_deref(), Some("/data"));
        assert_eq!(parent_within("/data/a/b", "/data").as_deref(), Some("/data/a"));
        assert_eq!(parent_within("/data", "/data"), None);
        assert_eq!(parent_within("/a", "/").as_deref(), Some("/"));
        assert_eq!(parent_within("a", "").as_deref(), Some(""));
    }

    #[test]
    fn joins_and_names() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("a/b", "c"), "a/b/c");
        assert_eq!(name_of("a/b/c.txt"), "c.txt");
        assert_eq!(name_of("c.txt"), "c.txt");
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a"), 1);
        assert_eq!(depth("a/b/c"), 3);
        assert_eq!(depth("/data/a"), 2);
    }

    #[test]
    fn ancestors_stop_at_root() {
        let found: Vec<String> = ancestors("a/b/c/d.txt", "").collect();
        assert_eq!(found, vec!["a/b/c", "a/b", "a"]);

        let found: Vec<String> = ancestors("/r/x/y", "/r").collect();
        assert_eq!(found, vec!["/r/x"]);
    }
}
