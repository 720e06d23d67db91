//! Concurrent walk of a real filesystem.
//!
//! ```text
//! expand(root) ── read_dir ── stat files (JoinSet) ── cache.put ── Listing
//!      │
//!      ├── expand(sub 1) ...
//!      └── expand(sub N) ...          (JoinSet, awaited before returning)
//! ```
//!
//! Every read_dir and every stat takes one permit from a semaphore shared by
//! the whole walk, and gives it back when the call returns, success or not.
//! A directory's permit is released before its subdirectories are spawned,
//! so a limit of 1 cannot deadlock.
//!
//! A directory's `Listing` is always sent before any of its subdirectories
//! is expanded; consumers rely on seeing a parent before its children.

use crate::core::cancel::CancelFlag;
use crate::models::entry::Entry;
use crate::services::fs::listing::{read_children, stat_size, DirChild, FsBackend};
use crate::services::fs::path::{join, normalize};
use crate::services::scan::cache::ListingCache;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// What the walker reports, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    /// Direct children of `dir`. Files carry their final size, directories
    /// carry zero.
    Listing { dir: String, children: Vec<Entry> },
    /// A single read or stat failed. The walk carries on.
    Failure { path: String, message: String },
}

#[derive(Debug, Default)]
pub struct WalkStats {
    pub dirs: AtomicU64,
    pub files: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl WalkStats {
    fn record_dir(&self) {
        self.dirs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_file(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WalkTotals {
        WalkTotals {
            dirs: self.dirs.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkTotals {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// A walk in progress. Events arrive on `events` until every task is done,
/// then the channel closes.
#[derive(Debug)]
pub struct WalkHandle {
    pub events: mpsc::UnboundedReceiver<WalkEvent>,
    pub stats: Arc<WalkStats>,
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct LiveWalker {
    backend: Arc<dyn FsBackend>,
    concurrency_limit: Option<usize>,
}

impl LiveWalker {
    pub fn new(backend: Arc<dyn FsBackend>) -> Self {
        Self {
            backend,
            concurrency_limit: None,
        }
    }

    /// `None` means unbounded.
    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Starts walking `root`. Each call is an independent walk; listings are
    /// written into `cache` as they are read.
    pub fn walk(&self, root: &str, cache: Arc<ListingCache>, cancel: CancelFlag) -> WalkHandle {
        let permits = self
            .concurrency_limit
            .map(|limit| limit.clamp(1, Semaphore::MAX_PERMITS))
            .unwrap_or(Semaphore::MAX_PERMITS);
        let (tx, events) = mpsc::unbounded_channel();
        let stats = Arc::new(WalkStats::default());
        let ctx = Arc::new(WalkContext {
            backend: Arc::clone(&self.backend),
            cache,
            semaphore: Arc::new(Semaphore::new(permits)),
            cancel,
            tx,
            stats: Arc::clone(&stats),
        });
        debug!(root, permits, "starting walk");
        let task = tokio::spawn(expand(ctx, normalize(root)));
        WalkHandle {
            events,
            stats,
            task,
        }
    }
}

struct WalkContext {
    backend: Arc<dyn FsBackend>,
    cache: Arc<ListingCache>,
    semaphore: Arc<Semaphore>,
    cancel: CancelFlag,
    tx: mpsc::UnboundedSender<WalkEvent>,
    stats: Arc<WalkStats>,
}

impl WalkContext {
    /// `None` once cancelled, either before or while waiting for a slot.
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(permit)
    }

    fn send(&self, event: WalkEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.tx.send(event).is_err() {
            // Nobody is listening any more.
            self.cancel.cancel();
            return false;
        }
        true
    }

    fn fail(&self, path: &str, err: impl std::fmt::Display) {
        warn!(path, error = %err, "walk failure");
        self.stats.record_error();
        self.send(WalkEvent::Failure {
            path: path.to_string(),
            message: err.to_string(),
        });
    }
}

type WalkFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

fn expand(ctx: Arc<WalkContext>, dir: String) -> WalkFuture {
    Box::pin(async move {
        let names = {
            let Some(_permit) = ctx.acquire().await else {
                return;
            };
            read_children(Arc::clone(&ctx.backend), dir.clone()).await
        };
        let names = match names {
            Ok(names) => names,
            Err(err) => {
                ctx.fail(&dir, &err);
                Vec::new()
            }
        };

        let Some(children) = stat_children(&ctx, &dir, &names).await else {
            return;
        };

        ctx.stats.record_dir();
        ctx.cache.put(&dir, children.clone());
        let subdirs: Vec<String> = children
            .iter()
            .filter(|c| c.is_directory)
            .map(|c| c.path.clone())
            .collect();
        if !ctx.send(WalkEvent::Listing {
            dir: dir.clone(),
            children,
        }) {
            return;
        }

        let mut tasks = JoinSet::new();
        for sub in subdirs {
            tasks.spawn(expand(Arc::clone(&ctx), sub));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(dir = %dir, error = %err, "subdirectory task failed");
            }
        }
    })
}

/// Builds `dir`'s entries, stating files concurrently. `None` when the walk
/// was cancelled part way.
async fn stat_children(ctx: &Arc<WalkContext>, dir: &str, names: &[DirChild]) -> Option<Vec<Entry>> {
    let mut children: Vec<Entry> = names
        .iter()
        .map(|child| {
            let path = join(dir, &child.name);
            if child.is_dir {
                Entry::directory(&path)
            } else {
                Entry::file(&path, 0)
            }
        })
        .collect();

    let mut stats = JoinSet::new();
    for (idx, child) in children.iter().enumerate() {
        if child.is_directory {
            continue;
        }
        let ctx = Arc::clone(ctx);
        let path = child.path.clone();
        stats.spawn(async move {
            let _permit = ctx.acquire().await?;
            let size = stat_size(Arc::clone(&ctx.backend), path).await;
            Some((idx, size))
        });
    }

    let mut cancelled = false;
    while let Some(joined) = stats.join_next().await {
        match joined {
            Ok(Some((idx, Ok(size)))) => {
                children[idx].size = size;
                ctx.stats.record_file(size);
            }
            Ok(Some((idx, Err(err)))) => {
                ctx.stats.record_file(0);
                ctx.fail(&children[idx].path, &err);
            }
            Ok(None) => cancelled = true,
            Err(err) => warn!(dir, error = %err, "stat task failed"),
        }
    }

    if cancelled || ctx.cancel.is_cancelled() {
        return None;
    }
    Some(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fs::listing::LocalFs;
    use crate::services::fs::path::normalize_path;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn parent_listing_arrives_before_children() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), b"1").unwrap();
        fs::write(dir.path().join("a/b/two"), b"22").unwrap();
        let root = normalize_path(dir.path());

        let cache = Arc::new(ListingCache::new());
        let walker = LiveWalker::new(Arc::new(LocalFs)).with_concurrency_limit(Some(1));
        let mut handle = walker.walk(&root, Arc::clone(&cache), CancelFlag::new());

        let mut order = Vec::new();
        while let Some(event) = handle.events.recv().await {
            if let WalkEvent::Listing { dir, .. } = event {
                order.push(dir);
            }
        }
        handle.task.await.unwrap();

        assert_eq!(order, vec![root.clone(), format!("{root}/a"), format!("{root}/a/b")]);
        let totals = handle.stats.snapshot();
        assert_eq!(totals.dirs, 3);
        assert_eq!(totals.files, 2);
        assert_eq!(totals.bytes, 3);
        assert_eq!(cache.sum_children(&format!("{root}/a/b")), 2);
    }

    #[tokio::test]
    async fn cancelled_walk_reports_nothing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let cache = Arc::new(ListingCache::new());
        let walker = LiveWalker::new(Arc::new(LocalFs));
        let mut handle = walker.walk(&normalize_path(dir.path()), Arc::clone(&cache), cancel);
        assert!(handle.events.recv().await.is_none());
        assert!(cache.is_empty());
    }
}
