//! Profiles: the scheme type the daemon manages.
//!
//! A profile is a name plus a flat JSON object of settings, stored as one
//! document per file:
//!
//! ```json
//! {
//!   "name": "Work",
//!   "font": "Iosevka",
//!   "fontSize": 13
//! }
//! ```
//!
//! A profile without settings serializes to nothing, so its file is removed.

use parking_lot::RwLock;
use scheme_core::document::NAME_ATTRIBUTE;
use scheme_core::{
    Document, DocumentError, SchemeContentChangedHandler, SchemeProcessor, SchemeRef,
    SchemeSerializer,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub struct Profile {
    name: RwLock<String>,
    settings: RwLock<Map<String, Value>>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, Map::new())
    }

    pub fn with_settings(name: impl Into<String>, settings: Map<String, Value>) -> Self {
        Self {
            name: RwLock::new(name.into()),
            settings: RwLock::new(settings),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn rename(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.settings.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.settings.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.settings.write().remove(key)
    }

    pub fn settings(&self) -> Map<String, Value> {
        self.settings.read().clone()
    }

    fn replace_settings(&self, settings: Map<String, Value>) {
        *self.settings.write() = settings;
    }
}

/// Settings of a profile document: every attribute except the name.
fn settings_of(document: &Document) -> Result<Map<String, Value>, DocumentError> {
    let Value::Object(root) = document.root() else {
        return Err(DocumentError::Invalid("profile must be a JSON object".into()));
    };
    Ok(root
        .iter()
        .filter(|(key, _)| key.as_str() != NAME_ATTRIBUTE)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

pub struct ProfileSerializer;

impl SchemeSerializer<Profile> for ProfileSerializer {
    fn serialize(&self, profile: &Profile) -> Result<Option<Document>, DocumentError> {
        let settings = profile.settings();
        if settings.is_empty() {
            return Ok(None);
        }
        let mut root = Map::with_capacity(settings.len() + 1);
        root.insert(NAME_ATTRIBUTE.to_string(), Value::String(profile.name()));
        root.extend(settings);
        Document::new(Value::Object(root)).map(Some)
    }

    fn deserialize(
        &self,
        document: Document,
        key: &str,
        _bundled: bool,
    ) -> Result<Profile, DocumentError> {
        Ok(Profile::with_settings(key, settings_of(&document)?))
    }
}

/// Keys profiles by name, refreshes them in place on external edits and
/// logs lifecycle callbacks.
#[derive(Debug, Default)]
pub struct ProfileProcessor;

impl SchemeProcessor<Profile> for ProfileProcessor {
    fn scheme_key(&self, profile: &Profile) -> String {
        profile.name()
    }

    fn is_scheme_file(&self, file_name: &str) -> bool {
        !file_name.starts_with('.')
    }

    fn on_scheme_added(&self, profile: &SchemeRef<Profile>) {
        debug!("Profile added: {}", profile.name());
    }

    fn on_scheme_deleted(&self, profile: &SchemeRef<Profile>) {
        debug!("Profile removed: {}", profile.name());
    }

    fn on_current_scheme_switched(
        &self,
        old: Option<&SchemeRef<Profile>>,
        new: Option<&SchemeRef<Profile>>,
        _synchronous: bool,
    ) {
        let name = |profile: Option<&SchemeRef<Profile>>| {
            profile.map_or_else(|| "<none>".to_string(), |p| p.name())
        };
        info!("Current profile: {} -> {}", name(old), name(new));
    }

    fn as_content_changed_handler(&self) -> Option<&dyn SchemeContentChangedHandler<Profile>> {
        Some(self)
    }
}

impl SchemeContentChangedHandler<Profile> for ProfileProcessor {
    fn scheme_content_changed(&self, profile: &SchemeRef<Profile>, key: &str, document: &Document) {
        match settings_of(document) {
            Ok(settings) => {
                profile.rename(key);
                profile.replace_settings(settings);
                debug!("Profile {} reloaded in place", key);
            }
            Err(e) => debug!("Ignoring edit of profile {}: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheme_core::{InMemoryFs, SchemeStore, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_serialize_writes_name_and_settings() {
        let profile = Profile::new("Work");
        profile.set("fontSize", json!(13));

        let document = ProfileSerializer.serialize(&profile).unwrap().unwrap();
        assert_eq!(document.attribute(NAME_ATTRIBUTE), Some("Work"));
        assert_eq!(document.root()["fontSize"], json!(13));
    }

    #[test]
    fn test_profile_without_settings_is_not_serialized() {
        let profile = Profile::new("Empty");
        assert!(ProfileSerializer.serialize(&profile).unwrap().is_none());
    }

    #[test]
    fn test_deserialize_takes_key_and_drops_name() {
        let document = Document::new(json!({"name": "Work", "font": "Iosevka"})).unwrap();
        let profile = ProfileSerializer.deserialize(document, "Work", false).unwrap();

        assert_eq!(profile.name(), "Work");
        assert_eq!(profile.get("font"), Some(json!("Iosevka")));
        assert!(profile.get(NAME_ATTRIBUTE).is_none());
    }

    #[test]
    fn test_external_edit_replaces_settings_in_place() {
        let store = SchemeStore::new(
            StoreConfig::new("profiles"),
            Arc::new(ProfileProcessor),
            Arc::new(ProfileSerializer),
            Arc::new(InMemoryFs::new()),
        );
        let profile = store.new_ref(Profile::new("Work"));
        profile.set("font", json!("Iosevka"));

        let document = Document::new(json!({"name": "Work", "fontSize": 14})).unwrap();
        let processor = ProfileProcessor;
        let handler = processor.as_content_changed_handler().unwrap();
        handler.scheme_content_changed(&profile, "Work", &document);

        assert_eq!(profile.get("fontSize"), Some(json!(14)));
        assert!(profile.get("font").is_none());
    }
}
