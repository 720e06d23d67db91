use crate::core::errors::Result;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::task;

/// A name as returned by a directory read, before any stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirChild {
    pub name: String,
    pub is_dir: bool,
}

/// The filesystem operations the walker needs. Both calls are blocking and
/// are always run on the blocking pool.
pub trait FsBackend: Send + Sync {
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirChild>>;
    fn file_size(&self, path: &str) -> io::Result<u64>;

    /// `Ok(false)` for anything that is not a directory.
    fn is_dir(&self, path: &str) -> io::Result<bool>;
}

/// The local filesystem. Symlinks are reported as files carrying their own
/// link size and are never followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FsBackend for LocalFs {
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirChild>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(Path::new(path))? {
            let entry = entry?;
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            children.push(DirChild {
                name: os_str_to_string(entry.file_name()),
                is_dir,
            });
        }
        // Listing order is advisory; sort for stable output.
        children.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(children)
    }

    fn file_size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::symlink_metadata(Path::new(path))?.len())
    }

    fn is_dir(&self, path: &str) -> io::Result<bool> {
        Ok(fs::symlink_metadata(Path::new(path))?.file_type().is_dir())
    }
}

/// Reads one directory on the blocking pool.
pub async fn read_children(backend: Arc<dyn FsBackend>, dir: String) -> Result<Vec<DirChild>> {
    let children = task::spawn_blocking(move || backend.read_dir(&dir)).await??;
    Ok(children)
}

/// Stats one file on the blocking pool.
pub async fn stat_size(backend: Arc<dyn FsBackend>, path: String) -> Result<u64> {
    let size = task::spawn_blocking(move || backend.file_size(&path)).await??;
    Ok(size)
}

pub async fn probe_dir(backend: Arc<dyn FsBackend>, path: String) -> Result<bool> {
    let is_dir = task::spawn_blocking(move || backend.is_dir(&path)).await??;
    Ok(is_dir)
}

fn os_str_to_string(s: impl AsRef<OsStr>) -> String {
    s.as_ref().to_string_lossy().into_owned()
}
