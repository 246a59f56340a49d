//! Tracks files the store itself just wrote or deleted.
//!
//! Watchers that report native filesystem events cannot say who caused a
//! change. The store marks every path BEFORE touching it; when the watcher
//! reports that path, the reconciler consumes the mark and drops the event
//! instead of reloading what it just saved.
//!
//! Marks expire after `MARK_TTL` so that a watcher event lost under load
//! cannot leave a stale mark behind that would swallow a later external edit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use web_time::Instant;

/// Time-to-live for write marks. Marks older than this are considered stale.
const MARK_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
pub struct WriteTracker {
    /// Map of path -> timestamp when marked as written
    written_paths: Arc<Mutex<HashMap<String, Instant>>>,
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a path as about to be written or deleted by the store
    pub fn mark_written(&self, path: &str) {
        self.written_paths
            .lock()
            .insert(normalize(path), Instant::now());
    }

    /// Check if path was written by the store and consume the mark (returns true once).
    /// Returns false if the mark has expired.
    pub fn consume_written(&self, path: &str) -> bool {
        let mut paths = self.written_paths.lock();
        match paths.remove(&normalize(path)) {
            Some(timestamp) => timestamp.elapsed() < MARK_TTL,
            None => false,
        }
    }

    /// Remove expired marks to prevent memory growth.
    pub fn cleanup_expired(&self) {
        self.written_paths
            .lock()
            .retain(|_, timestamp| timestamp.elapsed() < MARK_TTL);
    }

    pub fn len(&self) -> usize {
        self.written_paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}
