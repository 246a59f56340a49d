//! File watcher with debouncing for the scheme root.
//!
//! Uses notify-debouncer-mini; every debounced callback becomes one batch of
//! [`RawEvent`]s. notify cannot say who caused a change, so events carry no
//! requestor and the store's write tracker recognizes its own writes.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use parking_lot::Mutex;
use scheme_core::{RawEvent, RawEventKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Debounce window for filesystem notifications.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Last known state of a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    is_dir: bool,
    mtime: Option<SystemTime>,
}

/// Keyed by logical path. Tells created from changed, remembers whether a
/// vanished path was a directory, and filters same-mtime notifications.
type SeenCache = Arc<Mutex<HashMap<String, Seen>>>;

/// File watcher that monitors the scheme root.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<Vec<RawEvent>>,
}

impl FileWatcher {
    /// Start watching `root` recursively.
    pub fn new(root: PathBuf) -> Result<Self> {
        // FSEvents on macOS reports canonical paths (/private/var/...)
        let root = root.canonicalize().unwrap_or(root);

        let cache: SeenCache = Arc::new(Mutex::new(HashMap::new()));
        scan(&root, &root, &mut cache.lock());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let cache_clone = Arc::clone(&cache);

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let batch = Self::process_batch(&events, &root_clone, &cache_clone);
                    if !batch.is_empty() && event_tx.send(batch).is_err() {
                        debug!("Watcher receiver dropped");
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn one debounced callback into a batch, parents before children.
    fn process_batch(events: &[DebouncedEvent], root: &Path, cache: &SeenCache) -> Vec<RawEvent> {
        let mut paths: Vec<&Path> = events.iter().map(|event| event.path.as_path()).collect();
        paths.sort();
        paths.dedup();

        let mut cache = cache.lock();
        paths
            .into_iter()
            .filter_map(|path| Self::process_path(path, root, &mut cache))
            .collect()
    }

    fn process_path(path: &Path, root: &Path, cache: &mut HashMap<String, Seen>) -> Option<RawEvent> {
        let relative = relative_path(root, path)?;
        if relative.starts_with('.') || relative.contains("/.") {
            return None;
        }

        let event = match std::fs::metadata(path) {
            Ok(metadata) => {
                let seen = Seen {
                    is_dir: metadata.is_dir(),
                    mtime: metadata.modified().ok(),
                };
                match cache.insert(relative.clone(), seen) {
                    None if seen.is_dir => RawEvent::directory(RawEventKind::Created, &relative),
                    None => RawEvent::file(RawEventKind::Created, &relative),
                    // children report their own changes
                    Some(_) if seen.is_dir => return None,
                    Some(previous) if previous == seen => {
                        trace!("Skipping spurious event for {}", relative);
                        return None;
                    }
                    Some(_) => RawEvent::file(RawEventKind::ContentChanged, &relative),
                }
            }
            Err(_) => {
                let previous = cache.remove(&relative);
                let prefix = format!("{}/", relative);
                cache.retain(|key, _| !key.starts_with(&prefix));
                match previous {
                    Some(seen) if seen.is_dir => RawEvent::directory(RawEventKind::Deleted, &relative),
                    _ => RawEvent::file(RawEventKind::Deleted, &relative),
                }
            }
        };

        debug!("File event: {:?} {}", event.kind, event.path);
        Some(event)
    }

    /// Get the receiver for event batches.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<Vec<RawEvent>> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Logical `/`-separated path of `path` below `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    let relative = parts?.join("/");
    (!relative.is_empty()).then_some(relative)
}

/// Seed the cache with what already exists.
fn scan(root: &Path, dir: &Path, cache: &mut HashMap<String, Seen>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let (Some(relative), Ok(metadata)) = (relative_path(root, &path), entry.metadata()) else {
            continue;
        };
        let is_dir = metadata.is_dir();
        cache.insert(
            relative,
            Seen {
                is_dir,
                mtime: metadata.modified().ok(),
            },
        );
        if is_dir {
            scan(root, &path, cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn process(root: &Path, cache: &mut HashMap<String, Seen>, relative: &str) -> Option<RawEvent> {
        FileWatcher::process_path(&root.join(relative), root, cache)
    }

    #[test]
    fn test_new_file_is_created_then_changed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut cache = HashMap::new();

        std::fs::write(root.join("a.json"), "{}").unwrap();
        let event = process(root, &mut cache, "a.json").unwrap();
        assert_eq!(event, RawEvent::file(RawEventKind::Created, "a.json"));

        // same mtime again: nothing happened
        assert!(process(root, &mut cache, "a.json").is_none());

        cache.insert(
            "a.json".to_string(),
            Seen {
                is_dir: false,
                mtime: Some(SystemTime::UNIX_EPOCH),
            },
        );
        let event = process(root, &mut cache, "a.json").unwrap();
        assert_eq!(event.kind, RawEventKind::ContentChanged);
    }

    #[test]
    fn test_deleted_directory_is_remembered_as_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir(root.join("schemes")).unwrap();
        std::fs::write(root.join("schemes/a.json"), "{}").unwrap();

        let mut cache = HashMap::new();
        scan(root, root, &mut cache);
        assert!(cache.contains_key("schemes/a.json"));

        std::fs::remove_dir_all(root.join("schemes")).unwrap();
        let event = process(root, &mut cache, "schemes").unwrap();

        assert_eq!(event, RawEvent::directory(RawEventKind::Deleted, "schemes"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hidden_paths_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/config"), "").unwrap();

        let mut cache = HashMap::new();
        assert!(process(root, &mut cache, ".git/config").is_none());
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            relative_path(root, &root.join("schemes").join("a.json")).as_deref(),
            Some("schemes/a.json")
        );
        assert_eq!(relative_path(root, root), None);
        assert_eq!(relative_path(root, Path::new("/elsewhere/a.json")), None);
    }
}
