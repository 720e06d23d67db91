#![allow(dead_code)]

use anyhow::{anyhow, Result};
use dirsize::models::ScanEvent;
use dirsize::services::fs::listing::{DirChild, FsBackend};
use dirsize::services::fs::path::{name_of, parent_of};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// In-memory filesystem with injectable read and stat failures.
#[derive(Debug, Default)]
pub struct MemoryFs {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, u64>,
    failing_stats: HashSet<String>,
    failing_reads: HashSet<String>,
}

impl MemoryFs {
    pub fn new(root: &str) -> Self {
        let mut fs = Self::default();
        fs.dirs.insert(root.to_string());
        fs
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.add_parents(path);
        self.dirs.insert(path.to_string());
        self
    }

    pub fn file(mut self, path: &str, size: u64) -> Self {
        self.add_parents(path);
        self.files.insert(path.to_string(), size);
        self
    }

    pub fn fail_stat(mut self, path: &str) -> Self {
        self.failing_stats.insert(path.to_string());
        self
    }

    pub fn fail_read(mut self, path: &str) -> Self {
        self.failing_reads.insert(path.to_string());
        self
    }

    fn add_parents(&mut self, path: &str) {
        let mut parent = parent_of(path);
        while !parent.is_empty() {
            self.dirs.insert(parent.clone());
            parent = parent_of(&parent);
        }
    }
}

impl FsBackend for MemoryFs {
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirChild>> {
        if self.failing_reads.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        if !self.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        let dirs = self.dirs.iter().filter(|d| parent_of(d) == path).map(|d| DirChild {
            name: name_of(d).to_string(),
            is_dir: true,
        });
        let files = self.files.keys().filter(|f| parent_of(f) == path).map(|f| DirChild {
            name: name_of(f).to_string(),
            is_dir: false,
        });
        Ok(dirs.chain(files).collect())
    }

    fn file_size(&self, path: &str) -> io::Result<u64> {
        if self.failing_stats.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "stat failed"));
        }
        self.files
            .get(path)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn is_dir(&self, path: &str) -> io::Result<bool> {
        if self.dirs.contains(path) {
            Ok(true)
        } else if self.files.contains_key(path) {
            Ok(false)
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "not found"))
        }
    }
}

/// Reads events until `scanComplete` or a fatal error.
pub async fn collect_until_done(rx: &mut UnboundedReceiver<ScanEvent>) -> Result<Vec<ScanEvent>> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await?
            .ok_or_else(|| anyhow!("event channel closed"))?;
        let done = matches!(event, ScanEvent::ScanComplete { .. }) || event.is_fatal();
        events.push(event);
        if done {
            return Ok(events);
        }
    }
}

pub fn drain(rx: &mut UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn finals(events: &[ScanEvent]) -> Vec<(String, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::SizeFinal { path, size } => Some((path.clone(), *size)),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[ScanEvent]) -> Vec<(Option<String>, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Error { path, message } => Some((path.clone(), message.clone())),
            _ => None,
        })
        .collect()
}
