//! scheme-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod daemon;
pub mod native_fs;
pub mod profile;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, Config, ConfigError};
pub use daemon::{Daemon, ProfileStore};
pub use native_fs::NativeFs;
pub use profile::{Profile, ProfileProcessor, ProfileSerializer};
pub use watcher::FileWatcher;
