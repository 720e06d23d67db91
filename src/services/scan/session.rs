//! The scan-session object: owns the cache, the active scan and the event
//! channel for one consumer. Nothing here is process-global, so several
//! engines can run side by side.

use crate::core::cancel::CancelFlag;
use crate::core::config::{EngineConfig, Strategy};
use crate::core::errors::{Error, Result};
use crate::models::entry::Entry;
use crate::models::event::{ScanEvent, ScanRequest};
use crate::services::fs::listing::{probe_dir, FsBackend, LocalFs};
use crate::services::fs::path::{normalize, parent_within};
use crate::services::fs::walker::{LiveWalker, WalkEvent};
use crate::services::scan::aggregate::{aggregate, FinalizeSink, IncrementalAggregator, PassOutcome, YieldBudget};
use crate::services::scan::cache::ListingCache;
use crate::services::scan::sort::{default_direction, SortKey};
use crate::services::scan::tree::DirectoryTree;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sends events for one scan until that scan is cancelled or the consumer
/// hangs up (which cancels it).
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<ScanEvent>,
    cancel: CancelFlag,
}

impl Emitter {
    pub fn new(tx: mpsc::UnboundedSender<ScanEvent>, cancel: CancelFlag) -> Self {
        Self { tx, cancel }
    }

    pub fn emit(&self, event: ScanEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ActiveScan {
    cancel: CancelFlag,
    task: Option<JoinHandle<()>>,
}

struct SessionState {
    cache: Arc<ListingCache>,
    active: Option<ActiveScan>,
}

pub struct ScanEngine {
    config: EngineConfig,
    backend: Arc<dyn FsBackend>,
    tx: mpsc::UnboundedSender<ScanEvent>,
    state: Mutex<SessionState>,
}

impl ScanEngine {
    /// Creates an engine over the local filesystem. `init` is the first
    /// event on the returned receiver.
    pub fn new(config: EngineConfig) -> Result<(Self, mpsc::UnboundedReceiver<ScanEvent>)> {
        Self::with_backend(config, Arc::new(LocalFs))
    }

    pub fn with_backend(
        config: EngineConfig,
        backend: Arc<dyn FsBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScanEvent>)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ScanEvent::Init)
            .map_err(|_| Error::Other("event receiver dropped before init".to_string()))?;
        let engine = Self {
            config,
            backend,
            tx,
            state: Mutex::new(SessionState {
                cache: Arc::new(ListingCache::new()),
                active: None,
            }),
        };
        Ok((engine, rx))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The cache of the current (or most recent) scan.
    pub fn cache(&self) -> Arc<ListingCache> {
        Arc::clone(&self.lock().cache)
    }

    /// Walks `root` on the live filesystem. A running scan is cancelled and
    /// its cache discarded. `concurrency_limit` overrides the configured one.
    pub fn start_scan(&self, root: &str, concurrency_limit: Option<usize>) -> Result<CancelFlag> {
        if concurrency_limit == Some(0) {
            return Err(Error::Config(
                "concurrency limit must be a positive integer".to_string(),
            ));
        }
        let limit = concurrency_limit.or(self.config.concurrency_limit);
        let root = normalize(root);
        let (emitter, cache) = self.replace_scan();
        let cancel = emitter.cancel_flag().clone();

        info!(root = %root, limit = ?limit, "starting live scan");
        let task = tokio::spawn(run_live_scan(
            root,
            limit,
            self.config.clone(),
            Arc::clone(&self.backend),
            cache,
            emitter,
        ));
        self.install_task(&cancel, task);
        Ok(cancel)
    }

    /// Aggregates entries the consumer already holds, in the background.
    pub fn scan_entries(&self, entries: Vec<Entry>, strategy: Option<Strategy>) -> CancelFlag {
        let mut scan = self.begin_in_memory();
        if let Some(strategy) = strategy {
            scan.set_strategy(strategy);
        }
        let cancel = scan.emitter.cancel_flag().clone();
        let task = tokio::spawn(async move {
            if scan.add_batch(entries).await {
                scan.finish().await;
            }
        });
        self.install_task(&cancel, task);
        cancel
    }

    /// Starts an in-memory scan driven batch by batch by the caller.
    pub fn begin_in_memory(&self) -> InMemoryScan {
        let (emitter, cache) = self.replace_scan();
        info!("starting in-memory scan");
        InMemoryScan::new(&self.config, cache, emitter)
    }

    /// Stops the active scan. Returns false when nothing was running.
    pub fn cancel_scan(&self) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active) if !active.cancel.is_cancelled() => {
                info!("scan cancelled");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Re-delivers a cached listing as a `listing` event. An uncached path
    /// is answered with an `error` event for that path.
    pub fn request_listing(&self, path: &str, sort: Option<SortKey>) -> Option<Vec<Entry>> {
        let path = normalize(path);
        let cache = self.cache();
        let children = match sort {
            Some(key) => cache.get_sorted(&path, key, default_direction(key)),
            None => cache.get(&path),
        };
        match &children {
            Some(children) => {
                let _ = self.tx.send(ScanEvent::Listing {
                    path,
                    children: children.clone(),
                });
            }
            None => {
                debug!(path = %path, "listing not cached");
                let _ = self
                    .tx
                    .send(ScanEvent::entry_error(path, "listing not cached"));
            }
        }
        children
    }

    /// Applies one consumer request.
    pub fn handle(&self, request: ScanRequest) -> Result<()> {
        match request {
            ScanRequest::StartScan {
                root,
                concurrency_limit,
            } => {
                self.start_scan(&root, concurrency_limit)?;
            }
            ScanRequest::ScanEntries { entries, strategy } => {
                self.scan_entries(entries, strategy);
            }
            ScanRequest::CancelScan => {
                self.cancel_scan();
            }
            ScanRequest::RequestListing { path, sort } => {
                self.request_listing(&path, sort);
            }
        }
        Ok(())
    }

    /// Reports a problem outside any scan, such as a malformed request.
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.tx.send(ScanEvent::fatal(message));
    }

    /// Waits for the background task of the active scan, if any.
    pub async fn wait_idle(&self) {
        let task = self.lock().active.as_mut().and_then(|active| active.task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "scan task failed");
            }
        }
    }

    fn replace_scan(&self) -> (Emitter, Arc<ListingCache>) {
        let mut state = self.lock();
        if let Some(previous) = state.active.take() {
            previous.cancel.cancel();
        }
        let cancel = CancelFlag::new();
        let cache = Arc::new(ListingCache::new());
        state.cache = Arc::clone(&cache);
        state.active = Some(ActiveScan {
            cancel: cancel.clone(),
            task: None,
        });
        (Emitter::new(self.tx.clone(), cancel), cache)
    }

    fn install_task(&self, cancel: &CancelFlag, task: JoinHandle<()>) {
        let mut state = self.lock();
        match state.active.as_mut() {
            Some(active) if active.cancel.same_as(cancel) => active.task = Some(task),
            // Replaced before we got here; the task winds down on its own.
            _ => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ScanEngine {
    fn drop(&mut self) {
        if let Some(active) = self.lock().active.take() {
            active.cancel.cancel();
        }
    }
}

async fn run_live_scan(
    root: String,
    limit: Option<usize>,
    config: EngineConfig,
    backend: Arc<dyn FsBackend>,
    cache: Arc<ListingCache>,
    emitter: Emitter,
) {
    let started = Instant::now();

    if let Err(err) = check_root(&backend, &root).await {
        warn!(root = %root, error = %err, "scan aborted");
        emitter.emit(ScanEvent::fatal(err.to_string()));
        return;
    }

    let walker = LiveWalker::new(backend).with_concurrency_limit(limit);
    let mut walk = walker.walk(&root, Arc::clone(&cache), emitter.cancel_flag().clone());
    let aggregator = IncrementalAggregator::new(&root, Arc::clone(&cache));
    let mut budget = YieldBudget::new(config.yield_every_n);

    'events: while let Some(event) = walk.events.recv().await {
        match event {
            WalkEvent::Listing { dir, children } => {
                let finalized = aggregator.on_listing(&dir, &children);
                let has_files = children.iter().any(|c| !c.is_directory);
                if !emitter.emit(ScanEvent::Listing {
                    path: dir.clone(),
                    children,
                }) {
                    break;
                }
                if finalized.is_empty() && config.emit_progress && has_files {
                    let size = aggregator.progress(&dir);
                    if !emitter.emit(ScanEvent::SizeProgress { path: dir, size }) {
                        break;
                    }
                }
                for (path, size) in finalized {
                    if !emitter.emit(ScanEvent::SizeFinal { path, size }) {
                        break 'events;
                    }
                    budget.tick().await;
                }
            }
            WalkEvent::Failure { path, message } => {
                if !emitter.emit(ScanEvent::entry_error(path, message)) {
                    break;
                }
            }
        }
    }

    if let Err(err) = walk.task.await {
        warn!(error = %err, "walk task failed");
    }
    if emitter.is_cancelled() {
        info!(root = %root, "scan stopped before completion");
        return;
    }
    if !aggregator.is_complete() {
        warn!(root = %root, "walk ended with unresolved directories");
    }

    let totals = walk.stats.snapshot();
    let total_bytes = aggregator
        .root_size()
        .unwrap_or_else(|| cache.sum_children(&root));
    info!(
        root = %root,
        dirs = totals.dirs,
        files = totals.files,
        finalized = aggregator.finalized_count(),
        errors = totals.errors,
        bytes = total_bytes,
        "scan complete"
    );
    emitter.emit(ScanEvent::ScanComplete {
        total_entries: cache.total_entries() as u64,
        elapsed_ms: started.elapsed().as_millis() as u64,
        total_bytes,
    });
}

async fn check_root(backend: &Arc<dyn FsBackend>, root: &str) -> Result<()> {
    if root.is_empty() {
        return Err(Error::RootNotFound(root.to_string()));
    }
    match probe_dir(Arc::clone(backend), root.to_string()).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::NotADirectory(root.to_string())),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::RootNotFound(root.to_string()))
        }
        Err(err) => Err(err),
    }
}

/// An in-memory scan fed in batches, for consumers that already hold their
/// entries (for example a browser file selection).
pub struct InMemoryScan {
    tree: DirectoryTree,
    cache: Arc<ListingCache>,
    emitter: Emitter,
    strategy: Strategy,
    yield_every_n: usize,
    emit_progress: bool,
    started: Instant,
}

impl InMemoryScan {
    pub fn new(config: &EngineConfig, cache: Arc<ListingCache>, emitter: Emitter) -> Self {
        Self {
            tree: DirectoryTree::new(""),
            cache,
            emitter,
            strategy: config.strategy,
            yield_every_n: config.yield_every_n.max(1),
            emit_progress: config.emit_progress,
            started: Instant::now(),
        }
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    /// Merges a batch and emits a `listing` for every directory whose
    /// children changed, followed by a `sizeProgress` for those holding
    /// files when progress is enabled. Entries are merged `yield_every_n`
    /// at a time with a yield in between. Returns false once the scan is
    /// cancelled.
    pub async fn add_batch(&mut self, entries: impl IntoIterator<Item = Entry>) -> bool {
        let mut entries = entries.into_iter();
        let mut touched = BTreeSet::new();
        loop {
            if self.emitter.is_cancelled() {
                return false;
            }
            let chunk: Vec<Entry> = entries.by_ref().take(self.yield_every_n).collect();
            if chunk.is_empty() {
                break;
            }
            touched.extend(self.tree.merge(chunk));
            tokio::task::yield_now().await;
        }
        debug!(directories = touched.len(), "merged batch");

        let mut budget = YieldBudget::new(self.yield_every_n);
        for dir in touched {
            let children = self.tree.children(&dir).map(<[Entry]>::to_vec).unwrap_or_default();
            let has_files = children.iter().any(|c| !c.is_directory);
            self.cache.put(&dir, children.clone());
            if !self.emitter.emit(ScanEvent::Listing {
                path: dir.clone(),
                children,
            }) {
                return false;
            }
            let pending = dir != self.tree.root() && !self.tree.is_final(&dir);
            if self.emit_progress && has_files && pending && !self.emit_partial(&dir) {
                return false;
            }
            budget.tick().await;
        }
        true
    }

    /// Mirrors the running sum of `dir` onto its cached entry and emits it.
    fn emit_partial(&self, dir: &str) -> bool {
        let size = self.tree.sum_children(dir);
        if let Some(parent) = parent_within(dir, self.tree.root()) {
            self.cache.update_child_size(&parent, dir, size, false);
        }
        self.emitter.emit(ScanEvent::SizeProgress {
            path: dir.to_string(),
            size,
        })
    }

    /// Computes every directory size, then reports completion.
    pub async fn finish(mut self) -> PassOutcome {
        let mut sink = CacheSink {
            root: self.tree.root().to_string(),
            cache: Arc::clone(&self.cache),
            emitter: self.emitter.clone(),
        };
        let outcome = aggregate(&mut self.tree, self.strategy, &mut sink, self.yield_every_n).await;
        if outcome.stopped || self.emitter.is_cancelled() {
            info!("in-memory scan stopped before completion");
            return outcome;
        }
        info!(
            strategy = self.strategy.as_str(),
            finalized = outcome.finalized,
            "in-memory scan complete"
        );
        self.emitter.emit(ScanEvent::ScanComplete {
            total_entries: self.tree.len() as u64,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            total_bytes: self.tree.total_bytes(),
        });
        outcome
    }
}

/// Mirrors each finalization into the cache, then emits it.
struct CacheSink {
    root: String,
    cache: Arc<ListingCache>,
    emitter: Emitter,
}

impl FinalizeSink for CacheSink {
    fn on_finalize(&mut self, path: &str, size: u64) -> bool {
        if let Some(parent) = parent_within(path, &self.root) {
            self.cache.update_child_size(&parent, path, size, true);
        }
        self.emitter.emit(ScanEvent::SizeFinal {
            path: path.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn init_is_first() {
        let (_engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        assert_eq!(drain(&mut rx), vec![ScanEvent::Init]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig::default().with_concurrency_limit(Some(0));
        assert!(matches!(ScanEngine::new(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn batched_in_memory_scan() {
        let (engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        let mut scan = engine.begin_in_memory();
        assert!(scan.add_batch(vec![Entry::file("a/x.txt", 10)]).await);
        assert!(
            scan.add_batch(vec![Entry::file("a/b/y.txt", 5), Entry::file("a/b/z.txt", 7)])
                .await
        );
        scan.finish().await;

        let events = drain(&mut rx);
        let finals: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::SizeFinal { path, size } => Some((path.as_str(), *size)),
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![("a/b", 12), ("a", 22)]);
        assert!(matches!(
            events.last(),
            Some(ScanEvent::ScanComplete {
                total_entries: 5,
                total_bytes: 22,
                ..
            })
        ));

        let root = engine.cache().get("").unwrap();
        assert_eq!(root[0].size, 22);
        assert!(root[0].size_final);
    }

    #[tokio::test]
    async fn request_listing_replays_cache() {
        let (engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        engine.scan_entries(
            vec![Entry::file("d/small", 1), Entry::file("d/big", 9)],
            Some(Strategy::DependencyCounted),
        );
        engine.wait_idle().await;
        drain(&mut rx);

        let listing = engine.request_listing("d/", Some(SortKey::Size)).unwrap();
        assert_eq!(listing[0].name, "big");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ScanEvent::Listing { path, .. }] if path == "d"
        ));
        assert!(engine.request_listing("nowhere", None).is_none());
        assert_eq!(
            drain(&mut rx),
            vec![ScanEvent::entry_error("nowhere", "listing not cached")]
        );
    }

    #[tokio::test]
    async fn in_memory_progress_follows_config() {
        let entries = || vec![Entry::file("a/x", 4), Entry::file("a/b/y", 6)];

        let (engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        let mut scan = engine.begin_in_memory();
        assert!(scan.add_batch(entries()).await);
        let progress: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ScanEvent::SizeProgress { .. }))
            .collect();
        assert_eq!(
            progress,
            vec![
                ScanEvent::SizeProgress { path: "a".into(), size: 4 },
                ScanEvent::SizeProgress { path: "a/b".into(), size: 6 },
            ]
        );
        assert_eq!(engine.cache().get("").unwrap()[0].size, 4);
        assert!(!engine.cache().get("").unwrap()[0].size_final);

        let quiet = EngineConfig {
            emit_progress: false,
            ..EngineConfig::default()
        };
        let (engine, mut rx) = ScanEngine::new(quiet).unwrap();
        let mut scan = engine.begin_in_memory();
        assert!(scan.add_batch(entries()).await);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ScanEvent::SizeProgress { .. })));
    }

    #[tokio::test]
    async fn large_batch_yields_to_other_tasks() {
        let config = EngineConfig {
            yield_every_n: 16,
            ..EngineConfig::default()
        };
        let (engine, _rx) = ScanEngine::new(config).unwrap();
        let beats = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stop = CancelFlag::new();
        let heartbeat = {
            let beats = Arc::clone(&beats);
            let stop = stop.clone();
            tokio::spawn(async move {
                while !stop.is_cancelled() {
                    beats.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        };

        let entries: Vec<Entry> = (0..1600)
            .map(|i| Entry::file(&format!("d{}/f{i}", i % 10), 1))
            .collect();
        let mut scan = engine.begin_in_memory();
        assert!(scan.add_batch(entries).await);
        let during = beats.load(std::sync::atomic::Ordering::Relaxed);
        stop.cancel();
        heartbeat.await.unwrap();

        // 100 merge chunks, each followed by a yield.
        assert!(during >= 50, "heartbeat ran only {during} times");
    }

    #[tokio::test]
    async fn cancelled_in_memory_scan_is_silent() {
        let (engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        drain(&mut rx);
        let mut scan = engine.begin_in_memory();
        assert!(engine.cancel_scan());
        assert!(!scan.add_batch(vec![Entry::file("a/x", 1)]).await);
        let outcome = scan.finish().await;
        assert_eq!(outcome.finalized, 0);
        assert!(drain(&mut rx).is_empty());
        assert!(!engine.cancel_scan());
    }

    #[tokio::test]
    async fn handles_requests() {
        let (engine, mut rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        drain(&mut rx);
        let request: ScanRequest = serde_json::from_str(
            r#"{"action":"scanEntries","entries":[{"path":"a/f","name":"f","isDirectory":false,"size":3,"sizeFinal":true}]}"#,
        )
        .unwrap();
        engine.handle(request).unwrap();
        engine.wait_idle().await;
        assert!(drain(&mut rx)
            .iter()
            .any(|e| *e == ScanEvent::SizeFinal { path: "a".into(), size: 3 }));

        let bad = ScanRequest::StartScan {
            root: "x".into(),
            concurrency_limit: Some(0),
        };
        assert!(matches!(engine.handle(bad), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn new_scan_replaces_cache() {
        let (engine, _rx) = ScanEngine::new(EngineConfig::default()).unwrap();
        engine.scan_entries(vec![Entry::file("old/f", 1)], None);
        engine.wait_idle().await;
        assert!(engine.cache().contains("old"));

        engine.scan_entries(vec![Entry::file("new/f", 1)], None);
        engine.wait_idle().await;
        assert!(!engine.cache().contains("old"));
        assert!(engine.cache().contains("new"));
    }
}
