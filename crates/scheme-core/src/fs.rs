//! FileSystem trait abstraction for the local scheme directory.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in scheme-daemon) - Uses std::fs under a root directory
//!
//! Paths are logical, `/`-separated and relative to the filesystem root
//! (e.g. `codestyles/Default.json`). All calls block the caller.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync`: the store is read from the
/// notification thread and saved from whichever thread owns it.
pub trait FileSystem: Send + Sync {
    /// Read file contents
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    fn mkdir(&self, path: &str) -> Result<()>;
}

/// Join a directory and a file name into a logical path.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Split a logical path into `(parent, name)`.
pub fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    /// Paths whose writes fail, for exercising error aggregation
    read_only: RwLock<HashSet<String>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes to `path` fail with an I/O error.
    pub fn set_read_only(&self, path: &str) {
        self.read_only.write().insert(Self::normalize_path(path));
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of successful deletes so far.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl FileSystem for InMemoryFs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.dirs.read().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        self.files
            .read()
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.read_only.read().contains(&path) {
            return Err(FsError::Io(format!("{} is read-only", path)));
        }
        if self.dirs.read().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent)?;
        }

        self.files.write().insert(path, content.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read();
        if !path.is_empty() && !dirs.contains(&path) {
            if self.files.read().contains_key(&path) {
                return Err(FsError::NotDirectory(path));
            }
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();

        for file_path in self.files.read().keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        if self.files.write().remove(&path).is_some() {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Only empty directories can be deleted
        let mut dirs = self.dirs.write();
        if dirs.contains(&path) {
            let prefix = format!("{}/", path);
            let has_children = self.files.read().keys().any(|p| p.starts_with(&prefix))
                || dirs.iter().any(|d| d.starts_with(&prefix));
            if has_children {
                return Err(FsError::Io(format!("directory not empty: {}", path)));
            }
            dirs.remove(&path);
            self.deletes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(true);
        }
        let is_dir = self.dirs.read().contains(&path);
        Ok(is_dir || self.files.read().contains_key(&path))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.files.read().contains_key(&path) {
            return Err(FsError::NotDirectory(path));
        }

        // Create parent first
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent)?;
        }

        self.dirs.write().insert(path);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows tests to keep a handle on the filesystem a store writes to
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path)
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content)
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path)
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path)
    }
}
