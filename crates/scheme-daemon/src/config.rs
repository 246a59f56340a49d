//! Daemon configuration: CLI flags with environment fallbacks.

use clap::Parser;
use scheme_core::StoreConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "scheme-daemon")]
#[command(about = "Keeps a directory of profiles in sync with the filesystem")]
pub struct Args {
    /// Root of the managed filesystem (supports ~ for home directory)
    #[arg(long, env = "SCHEME_ROOT")]
    pub root: String,

    /// Directory below the root that holds the profiles
    #[arg(long, default_value = "profiles", env = "SCHEME_DIRECTORY")]
    pub directory: String,

    /// Seconds between periodic saves
    #[arg(long, default_value_t = 30, env = "SCHEME_SAVE_INTERVAL")]
    pub save_interval: u64,

    /// Directory of read-only default profiles
    #[arg(long, env = "SCHEME_BUNDLED")]
    pub bundled: Option<String>,

    /// Profile to make current once it is loaded
    #[arg(long, env = "SCHEME_CURRENT")]
    pub current: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Validated daemon configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Absolute root the native filesystem is anchored at
    pub root: PathBuf,
    pub store: StoreConfig,
    pub save_interval: Duration,
    pub bundled: Option<PathBuf>,
    pub current: Option<String>,
}

impl Config {
    pub fn new(root: impl Into<PathBuf>, directory: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            root: root.into(),
            store: store_config(directory)?,
            save_interval: Duration::from_secs(30),
            bundled: None,
            current: None,
        })
    }
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let root = expand_tilde(&args.root);
        if root.exists() && !root.is_dir() {
            return Err(ConfigError::RootNotDirectory(root));
        }
        if args.save_interval == 0 {
            return Err(ConfigError::ZeroSaveInterval);
        }

        Ok(Self {
            root,
            store: store_config(&args.directory)?,
            save_interval: Duration::from_secs(args.save_interval),
            bundled: args.bundled.as_deref().map(expand_tilde),
            current: args.current.filter(|name| !name.is_empty()),
        })
    }
}

/// The managed directory must stay below the root.
fn store_config(directory: &str) -> Result<StoreConfig, ConfigError> {
    let trimmed = directory.trim_matches('/');
    let escapes = trimmed
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..");
    if trimmed.is_empty() || escapes || trimmed.contains('\\') {
        return Err(ConfigError::InvalidDirectory(directory.to_string()));
    }
    Ok(StoreConfig::new(trimmed).with_presentable_name(trimmed))
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Scheme root {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("Scheme directory must be a relative path below the root: {0:?}")]
    InvalidDirectory(String),

    #[error("Save interval must be at least one second")]
    ZeroSaveInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["scheme-daemon", "--root", "/srv/schemes"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::try_from(args(&["--directory", "profiles"])).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/schemes"));
        assert_eq!(config.store.directory, "profiles");
        assert_eq!(config.store.name(), "profiles");
        assert_eq!(config.save_interval, Duration::from_secs(30));
        assert!(config.bundled.is_none());
    }

    #[test]
    fn test_directory_is_trimmed() {
        let config = Config::try_from(args(&["--directory", "/editor/colors/"])).unwrap();
        assert_eq!(config.store.directory, "editor/colors");
    }

    #[test]
    fn test_directory_cannot_escape_root() {
        for directory in ["", "/", "../up", "a/../b", "a//b", "a\\b"] {
            let result = Config::try_from(args(&["--directory", directory]));
            assert!(
                matches!(result, Err(ConfigError::InvalidDirectory(_))),
                "{:?} should be rejected",
                directory
            );
        }
    }

    #[test]
    fn test_zero_save_interval_is_rejected() {
        let result = Config::try_from(args(&["--directory", "p", "--save-interval", "0"]));
        assert!(matches!(result, Err(ConfigError::ZeroSaveInterval)));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/schemes"), home.join("schemes"));
        }
    }
}
