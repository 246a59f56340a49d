//! Daemon state: one profile store over the native filesystem.
//!
//! The store API blocks, so every call from the event loop goes through
//! `spawn_blocking`. The loop awaits each call before taking the next event,
//! which keeps saves and reconciliation from overlapping.

use crate::config::Config;
use crate::native_fs::NativeFs;
use crate::profile::{Profile, ProfileProcessor, ProfileSerializer};
use crate::watcher::FileWatcher;

use anyhow::{Context, Result};
use scheme_core::{RawEvent, SaveReport, SchemeStore, StoreEvent, Subscription};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub type ProfileStore = SchemeStore<Profile>;

pub struct Daemon {
    store: Arc<ProfileStore>,
    config: Config,
    root: PathBuf,
    /// Logs store events while held
    _events: Subscription,
}

impl Daemon {
    /// Create the root if needed, register bundled profiles and load the
    /// managed directory. Blocks.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("Failed to create scheme root {:?}", config.root))?;
        let root = config.root.canonicalize().unwrap_or_else(|_| config.root.clone());

        let store = SchemeStore::new(
            config.store.clone(),
            Arc::new(ProfileProcessor),
            Arc::new(ProfileSerializer),
            Arc::new(NativeFs::new(root.clone())),
        );
        let events = store.events().subscribe(log_store_event);
        let store = Arc::new(store);

        if let Some(bundled) = &config.bundled {
            load_bundled(&store, bundled)?;
        }
        if let Some(current) = &config.current {
            store.set_current_scheme_name(current, true);
        }
        store.load_schemes()?;

        Ok(Self {
            store,
            config,
            root,
            _events: events,
        })
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Canonical root the filesystem and watcher are anchored at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply one watcher batch.
    pub async fn on_batch(&self, batch: Vec<RawEvent>) {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.apply_changes(&batch)).await;
        match result {
            Ok(Ok(events)) if events.is_empty() => {}
            Ok(Ok(events)) => debug!("Reconciled {} profile event(s)", events.len()),
            Ok(Err(e)) => error!("Failed to apply profile changes: {}", e),
            Err(e) => error!("Change task failed: {}", e),
        }
    }

    /// Save every changed profile.
    pub async fn save(&self) -> Result<SaveReport> {
        let store = Arc::clone(&self.store);
        let report = tokio::task::spawn_blocking(move || {
            store.write_tracker().cleanup_expired();
            store.save()
        })
        .await??;
        Ok(report)
    }

    /// Main loop: watcher batches, periodic saves, and a final save once
    /// `shutdown` resolves.
    pub async fn run(&self, watcher: &mut FileWatcher, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.save_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(batch) = watcher.event_rx().recv() => {
                    self.on_batch(batch).await;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.save().await {
                        error!("Periodic save failed: {}", e);
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let report = self.save().await?;
        info!(
            "Final save: {} written, {} deleted",
            report.written.len(),
            report.deleted.len()
        );
        Ok(())
    }
}

/// Register every readable file in `dir` as a bundled profile.
fn load_bundled(store: &ProfileStore, dir: &Path) -> Result<()> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read bundled profiles in {:?}", dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| store.can_read(name))
        .collect();
    names.sort();

    for name in names {
        let bytes = match std::fs::read(dir.join(&name)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot read bundled profile {}: {}", name, e);
                continue;
            }
        };
        match store.load_bundled_scheme(&name, &bytes) {
            Ok(profile) => info!("Registered bundled profile {}", profile.name()),
            Err(e) => warn!("Skipping bundled profile {}: {}", name, e),
        }
    }
    Ok(())
}

fn log_store_event(event: &StoreEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!("Store event: {}", json),
        Err(e) => warn!("Cannot serialize store event: {}", e),
    }
}
