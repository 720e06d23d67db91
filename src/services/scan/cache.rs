//! Per-directory memo of children and their latest known sizes.
//!
//! Walker tasks write listings while the aggregator writes size fields, so
//! each directory's child list sits behind its own mutex; the outer map lock
//! is only held long enough to find or insert that mutex. Nothing is evicted
//! during a scan; a new scan gets a new cache.

use crate::models::entry::Entry;
use crate::services::scan::sort::{sort_entries, SortKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// One directory's children plus a path -> position index, kept in step
/// under the same mutex.
#[derive(Debug, Default)]
struct DirListing {
    children: Vec<Entry>,
    positions: HashMap<String, usize>,
}

impl DirListing {
    fn insert(&mut self, child: Entry) {
        if self.positions.contains_key(&child.path) {
            return;
        }
        self.positions.insert(child.path.clone(), self.children.len());
        self.children.push(child);
    }

    fn child_mut(&mut self, path: &str) -> Option<&mut Entry> {
        let idx = *self.positions.get(path)?;
        self.children.get_mut(idx)
    }
}

type Listing = Arc<Mutex<DirListing>>;

#[derive(Debug, Default)]
pub struct ListingCache {
    listings: RwLock<HashMap<String, Listing>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the children of `path`. Children already cached for `path` are
    /// kept as they are (with their sizes); only unseen paths are appended.
    pub fn put(&self, path: &str, children: Vec<Entry>) {
        let listing = self.listing_or_insert(path);
        let mut current = lock(&listing);
        current.children.reserve(children.len());
        for child in children {
            current.insert(child);
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<Entry>> {
        let listing = self.listing(path)?;
        let children = lock(&listing).children.clone();
        Some(children)
    }

    pub fn get_sorted(&self, path: &str, key: SortKey, asc: bool) -> Option<Vec<Entry>> {
        let mut children = self.get(path)?;
        sort_entries(&mut children, key, asc);
        Some(children)
    }

    /// Children at or above `min_size` bytes. Display-side only.
    pub fn get_filtered(&self, path: &str, min_size: u64) -> Option<Vec<Entry>> {
        let mut children = self.get(path)?;
        children.retain(|e| e.size >= min_size);
        Some(children)
    }

    /// Writes a size onto `child_path` inside `parent_path`'s listing.
    /// Final writes happen at most once; non-final writes never shrink.
    pub fn update_child_size(
        &self,
        parent_path: &str,
        child_path: &str,
        size: u64,
        is_final: bool,
    ) -> bool {
        let Some(listing) = self.listing(parent_path) else {
            return false;
        };
        let mut current = lock(&listing);
        let updated = match current.child_mut(child_path) {
            Some(entry) if is_final => entry.finalize(size),
            Some(entry) => entry.observe_size(size),
            None => false,
        };
        updated
    }

    pub fn sum_children(&self, path: &str) -> u64 {
        let Some(listing) = self.listing(path) else {
            return 0;
        };
        let total: u64 = lock(&listing).children.iter().map(|e| e.size).sum();
        total
    }

    pub fn contains(&self, path: &str) -> bool {
        self.listing(path).is_some()
    }

    /// Number of cached directories.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of entries across every cached listing.
    pub fn total_entries(&self) -> usize {
        self.read()
            .values()
            .map(|listing| lock(listing).children.len())
            .sum()
    }

    fn listing(&self, path: &str) -> Option<Listing> {
        self.read().get(path).cloned()
    }

    fn listing_or_insert(&self, path: &str) -> Listing {
        if let Some(listing) = self.listing(path) {
            return listing;
        }
        let mut listings = self.listings.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(listings.entry(path.to_string()).or_default())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Listing>> {
        self.listings.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(listing: &Listing) -> MutexGuard<'_, DirListing> {
    listing.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_and_get_round_trip() {
        let cache = ListingCache::new();
        assert!(cache.get("a").is_none());

        cache.put("a", vec![Entry::file("a/x", 1), Entry::directory("a/b")]);
        let children = cache.get("a").unwrap();
        assert_eq!(children.len(), 2);
        assert!(cache.contains("a"));
        assert_eq!(cache.total_entries(), 2);
    }

    #[test]
    fn put_does_not_duplicate_or_reset() {
        let cache = ListingCache::new();
        cache.put("a", vec![Entry::directory("a/b")]);
        assert!(cache.update_child_size("a", "a/b", 12, true));

        cache.put("a", vec![Entry::directory("a/b"), Entry::file("a/y", 2)]);
        let children = cache.get("a").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].size, 12);
        assert!(children[0].size_final);
    }

    #[test]
    fn final_size_is_written_once() {
        let cache = ListingCache::new();
        cache.put("", vec![Entry::directory("a")]);
        assert!(cache.update_child_size("", "a", 3, false));
        assert!(cache.update_child_size("", "a", 5, true));
        assert!(!cache.update_child_size("", "a", 9, true));
        assert!(!cache.update_child_size("", "a", 9, false));
        assert_eq!(cache.sum_children(""), 5);
        assert!(!cache.update_child_size("", "missing", 1, true));
        assert!(!cache.update_child_size("nope", "a", 1, true));
    }

    #[test]
    fn filtered_and_sorted_views() {
        let cache = ListingCache::new();
        cache.put(
            "d",
            vec![Entry::file("d/a", 1), Entry::file("d/b", 50), Entry::file("d/c", 10)],
        );
        let big: Vec<String> = cache
            .get_filtered("d", 10)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(big, vec!["b", "c"]);

        let by_size = cache.get_sorted("d", SortKey::Size, false).unwrap();
        assert_eq!(by_size[0].name, "b");
    }

    #[test]
    fn concurrent_writers_to_one_directory() {
        let cache = Arc::new(ListingCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0..50 {
                        cache.put("shared", vec![Entry::file(&format!("shared/{i}-{j}"), 1)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.get("shared").unwrap().len(), 400);
        assert_eq!(cache.sum_children("shared"), 400);
    }

    #[test]
    fn wide_directory_updates_by_path() {
        let cache = ListingCache::new();
        let children: Vec<Entry> = (0..10_000)
            .map(|i| Entry::directory(&format!("w/s{i}")))
            .collect();
        cache.put("w", children);
        for i in (0..10_000).rev() {
            assert!(cache.update_child_size("w", &format!("w/s{i}"), 1, true));
        }
        assert_eq!(cache.sum_children("w"), 10_000);

        let listing = cache.get("w").unwrap();
        assert_eq!(listing[0].path, "w/s0");
        assert_eq!(listing[9_999].path, "w/s9999");
        assert!(listing.iter().all(|e| e.size_final));
    }
}
