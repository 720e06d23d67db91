//! Flat entries to a parent -> children map.
//!
//! The tree is keyed by normalized directory path. The root key is always
//! present; every other key is linked as a child entry of its parent, so the
//! whole map is reachable from the root.

use crate::models::entry::Entry;
use crate::services::fs::path::{ancestors, name_of, normalize, parent_within};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct DirectoryTree {
    root: String,
    listings: HashMap<String, Vec<Entry>>,
    /// entry path -> index in its parent's child list
    positions: HashMap<String, usize>,
    root_size: Option<u64>,
}

impl DirectoryTree {
    /// An empty tree rooted at `root` (`""` for in-memory scans).
    pub fn new(root: &str) -> Self {
        let root = normalize(root);
        let mut listings = HashMap::new();
        listings.insert(root.clone(), Vec::new());
        Self {
            root,
            listings,
            positions: HashMap::new(),
            root_size: None,
        }
    }

    pub fn build(entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut tree = Self::new("");
        tree.merge(entries);
        tree
    }

    /// Adds a batch. Entries whose path is already present are skipped, so
    /// this can be called repeatedly with a growing set without duplicating
    /// children or touching sizes that were already finalized. Returns the
    /// directories whose child list changed.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = Entry>) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        for entry in entries {
            self.insert(entry, &mut touched);
        }
        touched
    }

    fn insert(&mut self, mut entry: Entry, touched: &mut BTreeSet<String>) {
        entry.path = normalize(&entry.path);
        if entry.path.is_empty() || entry.path == self.root {
            return;
        }
        if self.positions.contains_key(&entry.path) {
            if entry.is_directory {
                self.listings.entry(entry.path).or_default();
            }
            return;
        }

        let missing: Vec<String> = ancestors(&entry.path, &self.root)
            .take_while(|dir| !self.positions.contains_key(dir))
            .collect();
        for dir in missing.into_iter().rev() {
            self.link(Entry::directory(&dir), touched);
        }

        if entry.name.is_empty() {
            entry.name = name_of(&entry.path).to_string();
        }
        if entry.is_directory {
            entry.size = 0;
            entry.size_final = false;
        }
        self.link(entry, touched);
    }

    fn link(&mut self, entry: Entry, touched: &mut BTreeSet<String>) {
        let Some(parent) = parent_within(&entry.path, &self.root) else {
            return;
        };
        if entry.is_directory {
            self.listings.entry(entry.path.clone()).or_default();
        }
        let siblings = self.listings.entry(parent.clone()).or_default();
        self.positions.insert(entry.path.clone(), siblings.len());
        siblings.push(entry);
        touched.insert(parent);
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// In-memory scans hang everything off a virtual `""` root that has no
    /// entry of its own.
    pub fn has_virtual_root(&self) -> bool {
        self.root.is_empty()
    }

    pub fn children(&self, dir: &str) -> Option<&[Entry]> {
        self.listings.get(dir).map(Vec::as_slice)
    }

    pub fn contains_dir(&self, dir: &str) -> bool {
        self.listings.contains_key(dir)
    }

    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.listings.keys().map(String::as_str)
    }

    pub fn listings(&self) -> impl Iterator<Item = (&str, &[Entry])> {
        self.listings
            .iter()
            .map(|(dir, children)| (dir.as_str(), children.as_slice()))
    }

    pub fn entry(&self, path: &str) -> Option<&Entry> {
        let parent = parent_within(path, &self.root)?;
        let idx = *self.positions.get(path)?;
        self.listings.get(&parent)?.get(idx)
    }

    fn entry_mut(&mut self, path: &str) -> Option<&mut Entry> {
        let parent = parent_within(path, &self.root)?;
        let idx = *self.positions.get(path)?;
        self.listings.get_mut(&parent)?.get_mut(idx)
    }

    /// Number of entries, explicit and synthesized, excluding the root.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_final(&self, dir: &str) -> bool {
        if dir == self.root {
            return self.root_size.is_some();
        }
        self.entry(dir).map(|e| e.size_final).unwrap_or(false)
    }

    /// Current sum of `dir`'s direct children.
    pub fn sum_children(&self, dir: &str) -> u64 {
        self.children(dir)
            .map(|children| children.iter().map(|c| c.size).sum())
            .unwrap_or(0)
    }

    pub fn root_size(&self) -> Option<u64> {
        self.root_size
    }

    /// Total size known so far across the root's children.
    pub fn total_bytes(&self) -> u64 {
        self.root_size.unwrap_or_else(|| self.sum_children(&self.root))
    }

    /// Marks `dir` final with `size`. Returns false if it was already final.
    pub(crate) fn finalize_dir(&mut self, dir: &str, size: u64) -> bool {
        if dir == self.root {
            if self.root_size.is_some() {
                return false;
            }
            self.root_size = Some(size);
            return true;
        }
        match self.entry_mut(dir) {
            Some(entry) if entry.is_directory => entry.finalize(size),
            _ => false,
        }
    }
}
