//! Native filesystem implementation using std::fs.

use scheme_core::fs::{FileEntry, FileSystem, FsError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Native filesystem rooted at a base directory.
///
/// Logical paths are resolved below `base_path`; the store never sees
/// absolute paths.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_err(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

impl FileSystem for NativeFs {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).map_err(|e| map_err(path, e))
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(|e| map_err(path, e))?;
        }
        if full_path.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }

        fs::write(&full_path, content).map_err(|e| map_err(path, e))
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        if full_path.is_file() {
            return Err(FsError::NotDirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&full_path).map_err(|e| map_err(path, e))? {
            let entry = entry.map_err(|e| map_err(path, e))?;
            let metadata = entry.metadata().map_err(|e| map_err(path, e))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
            });
        }
        Ok(entries)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::symlink_metadata(&full_path).map_err(|e| map_err(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).map_err(|e| map_err(path, e))
        } else {
            fs::remove_file(&full_path).map_err(|e| map_err(path, e))
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path).map_err(|e| map_err(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_parents_and_reads_back() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path().to_path_buf());

        fs.write("schemes/Default.json", b"{}").unwrap();

        assert!(fs.exists("schemes").unwrap());
        assert_eq!(fs.read("schemes/Default.json").unwrap(), b"{}");
        assert_eq!(
            fs.list("schemes").unwrap(),
            vec![FileEntry {
                name: "Default.json".to_string(),
                is_dir: false,
            }]
        );
    }

    #[test]
    fn test_missing_paths_report_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path().to_path_buf());

        assert!(matches!(fs.read("nope.json"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.list("nope"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("nope.json"), Err(FsError::NotFound(_))));
        assert!(!fs.exists("nope.json").unwrap());
    }

    #[test]
    fn test_delete_refuses_non_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path().to_path_buf());
        fs.write("schemes/a.json", b"{}").unwrap();

        assert!(fs.delete("schemes").is_err());

        fs.delete("schemes/a.json").unwrap();
        fs.delete("schemes").unwrap();
        assert!(!fs.exists("schemes").unwrap());
    }

    #[test]
    fn test_read_directory_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let fs = NativeFs::new(temp_dir.path().to_path_buf());
        fs.mkdir("schemes").unwrap();

        assert!(matches!(fs.read("schemes"), Err(FsError::IsDirectory(_))));
    }
}
