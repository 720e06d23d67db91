//! Bottom-up directory sizes.
//!
//! A directory's size is the sum of its direct children: files contribute
//! their observed size, subdirectories contribute their own final size. So a
//! directory may only be finalized after every subdirectory under it has
//! been, and every pass here emits in that order.
//!
//! Two whole-tree passes are provided ([`depth_sorted`] and
//! [`dependency_counted`]) plus [`IncrementalAggregator`], which finalizes
//! directories as their listings arrive from a live walk.

use crate::core::config::Strategy;
use crate::models::entry::Entry;
use crate::services::fs::path::{depth, parent_within};
use crate::services::scan::cache::ListingCache;
use crate::services::scan::tree::DirectoryTree;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Receives each `(path, size)` finalization in order. Returning `false`
/// stops the pass; nothing further is finalized.
pub trait FinalizeSink {
    fn on_finalize(&mut self, path: &str, size: u64) -> bool;
}

impl FinalizeSink for Vec<(String, u64)> {
    fn on_finalize(&mut self, path: &str, size: u64) -> bool {
        self.push((path.to_string(), size));
        true
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub finalized: usize,
    /// The sink asked to stop before the pass finished.
    pub stopped: bool,
}

/// Hands control back to the runtime every `every` steps.
#[derive(Debug)]
pub struct YieldBudget {
    every: usize,
    used: usize,
}

impl YieldBudget {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            used: 0,
        }
    }

    pub async fn tick(&mut self) {
        self.used += 1;
        if self.used >= self.every {
            self.used = 0;
            tokio::task::yield_now().await;
        }
    }
}

/// Unresolved subdirectory count per directory.
#[derive(Debug, Default)]
pub struct PendingCounts {
    counts: HashMap<String, usize>,
}

impl PendingCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `pending` unresolved subdirectories for `dir`. Returns true
    /// when `dir` is ready right away.
    pub fn register(&mut self, dir: &str, pending: usize) -> bool {
        if pending == 0 {
            self.counts.remove(dir);
            return true;
        }
        self.counts.insert(dir.to_string(), pending);
        false
    }

    /// One subdirectory of `parent` became final. Returns true exactly when
    /// that was the last one.
    pub fn resolve_child(&mut self, parent: &str) -> bool {
        let Some(count) = self.counts.get_mut(parent) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(parent);
            true
        } else {
            false
        }
    }

    pub fn get(&self, dir: &str) -> Option<usize> {
        self.counts.get(dir).copied()
    }

    /// Directories still waiting on at least one subdirectory.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

pub async fn aggregate<S: FinalizeSink + ?Sized>(
    tree: &mut DirectoryTree,
    strategy: Strategy,
    sink: &mut S,
    yield_every: usize,
) -> PassOutcome {
    match strategy {
        Strategy::DepthSorted => depth_sorted(tree, sink, yield_every).await,
        Strategy::DependencyCounted => dependency_counted(tree, sink, yield_every).await,
    }
}

/// Directories of `tree` that still need a final size. The virtual root of
/// an in-memory tree is never finalized.
fn open_directories(tree: &DirectoryTree) -> Vec<String> {
    tree.directories()
        .filter(|dir| !(tree.has_virtual_root() && dir.is_empty()))
        .filter(|dir| !tree.is_final(dir))
        .map(str::to_string)
        .collect()
}

fn finalize_one<S: FinalizeSink + ?Sized>(tree: &mut DirectoryTree, dir: &str, sink: &mut S) -> bool {
    let size = tree.sum_children(dir);
    tree.finalize_dir(dir, size);
    sink.on_finalize(dir, size)
}

/// Every subdirectory is strictly deeper than its parent, so descending
/// depth is a valid bottom-up order when the whole tree is known.
pub async fn depth_sorted<S: FinalizeSink + ?Sized>(
    tree: &mut DirectoryTree,
    sink: &mut S,
    yield_every: usize,
) -> PassOutcome {
    let mut dirs = open_directories(tree);
    dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

    let mut outcome = PassOutcome::default();
    let mut budget = YieldBudget::new(yield_every);
    for dir in dirs {
        outcome.finalized += 1;
        if !finalize_one(tree, &dir, sink) {
            outcome.stopped = true;
            break;
        }
        budget.tick().await;
    }
    debug!(finalized = outcome.finalized, "depth-sorted pass done");
    outcome
}

/// Kahn-style pass: seed with directories that have no open subdirectory,
/// then release each parent once its last subdirectory is final.
pub async fn dependency_counted<S: FinalizeSink + ?Sized>(
    tree: &mut DirectoryTree,
    sink: &mut S,
    yield_every: usize,
) -> PassOutcome {
    let mut dirs = open_directories(tree);
    dirs.sort();

    let mut pending = PendingCounts::new();
    let mut ready = VecDeque::new();
    for dir in &dirs {
        let open_subdirs = tree
            .children(dir)
            .map(|children| children.iter().filter(|c| c.is_directory && !c.size_final).count())
            .unwrap_or(0);
        if pending.register(dir, open_subdirs) {
            ready.push_back(dir.clone());
        }
    }

    let mut outcome = PassOutcome::default();
    let mut budget = YieldBudget::new(yield_every);
    while let Some(dir) = ready.pop_front() {
        outcome.finalized += 1;
        if !finalize_one(tree, &dir, sink) {
            outcome.stopped = true;
            break;
        }
        if let Some(parent) = parent_within(&dir, tree.root()) {
            if pending.resolve_child(&parent) {
                ready.push_back(parent);
            }
        }
        budget.tick().await;
    }
    debug!(
        finalized = outcome.finalized,
        unresolved = pending.len(),
        "dependency-counted pass done"
    );
    outcome
}

/// Finalizes directories of a live scan as their listings land in the
/// cache. Safe to share between tasks: the decrement-and-test on a parent's
/// pending count and the size write that precedes it happen under one lock.
#[derive(Debug)]
pub struct IncrementalAggregator {
    root: String,
    cache: Arc<ListingCache>,
    state: Mutex<IncrementalState>,
}

#[derive(Debug, Default)]
struct IncrementalState {
    pending: PendingCounts,
    root_size: Option<u64>,
    finalized: usize,
}

impl IncrementalAggregator {
    pub fn new(root: &str, cache: Arc<ListingCache>) -> Self {
        Self {
            root: root.to_string(),
            cache,
            state: Mutex::new(IncrementalState::default()),
        }
    }

    /// Registers `dir`, whose listing is already in the cache. Returns every
    /// directory this made final, children before parents.
    pub fn on_listing(&self, dir: &str, children: &[Entry]) -> Vec<(String, u64)> {
        let open_subdirs = children
            .iter()
            .filter(|c| c.is_directory && !c.size_final)
            .count();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.pending.register(dir, open_subdirs) {
            return Vec::new();
        }

        let mut finalized = Vec::new();
        let mut current = Some(dir.to_string());
        while let Some(dir) = current.take() {
            let size = self.cache.sum_children(&dir);
            state.finalized += 1;
            match parent_within(&dir, &self.root) {
                Some(parent) => {
                    self.cache.update_child_size(&parent, &dir, size, true);
                    finalized.push((dir, size));
                    if state.pending.resolve_child(&parent) {
                        current = Some(parent);
                    }
                }
                None => {
                    state.root_size = Some(size);
                    finalized.push((dir, size));
                }
            }
        }
        finalized
    }

    /// Writes the current partial sum of `dir` onto its entry and returns it.
    pub fn progress(&self, dir: &str) -> u64 {
        let partial = self.cache.sum_children(dir);
        if let Some(parent) = parent_within(dir, &self.root) {
            self.cache.update_child_size(&parent, dir, partial, false);
        }
        partial
    }

    pub fn root_size(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .root_size
    }

    pub fn is_complete(&self) -> bool {
        self.root_size().is_some()
    }

    pub fn finalized_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finalized
    }
}
