//! Store configuration.

use crate::provider::RoamingType;
use serde::{Deserialize, Serialize};

/// Extension used when the processor does not supply its own.
pub const DEFAULT_EXTENSION: &str = ".json";

/// Where and how a store persists its schemes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Managed directory, as a logical path (e.g. `codestyles`).
    pub directory: String,
    pub roaming_type: RoamingType,
    /// Used in log messages; defaults to the directory.
    pub presentable_name: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: "schemes".to_string(),
            roaming_type: RoamingType::Default,
            presentable_name: None,
        }
    }
}

impl StoreConfig {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into().trim_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn with_roaming_type(mut self, roaming_type: RoamingType) -> Self {
        self.roaming_type = roaming_type;
        self
    }

    pub fn with_presentable_name(mut self, name: impl Into<String>) -> Self {
        self.presentable_name = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        self.presentable_name.as_deref().unwrap_or(&self.directory)
    }
}
