//! Mutable settings surface: LLM model, API key, defaults.
//!
//! Persisted as one JSON file; sensitive values are masked on read and only
//! replaced when an update supplies a new value.

use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    llm_api_key: Option<String>,
    llm_model: Option<String>,
    default_profile: Option<String>,
}

/// Partial update; absent fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub default_profile: Option<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    values: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!(target: "server", path = %path.display(), error = %err, "settings file unreadable, starting fresh");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };
        Self {
            path,
            values: RwLock::new(values),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.values
            .read()
            .llm_api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn api_key(&self) -> Option<String> {
        self.values.read().llm_api_key.clone()
    }

    pub fn llm_model(&self) -> Option<String> {
        self.values.read().llm_model.clone()
    }

    pub fn default_profile(&self) -> Option<String> {
        self.values.read().default_profile.clone()
    }

    /// Settings with sensitive values masked, for the read surface.
    pub fn masked(&self) -> Value {
        let values = self.values.read();
        json!({
            "llm_api_key": values.llm_api_key.as_deref().map(mask_secret),
            "llm_model": values.llm_model,
            "default_profile": values.default_profile,
        })
    }

    pub fn update(&self, update: SettingsUpdate) {
        {
            let mut values = self.values.write();
            if let Some(key) = update.llm_api_key {
                values.llm_api_key = Some(key);
            }
            if let Some(model) = update.llm_model {
                values.llm_model = Some(model);
            }
            if let Some(profile) = update.default_profile {
                values.default_profile = Some(profile);
            }
        }
        self.persist();
    }

    fn persist(&self) {
        let payload = {
            let values = self.values.read();
            serde_json::to_vec_pretty(&*values)
        };
        let Ok(payload) = payload else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let temp = self.path.with_extension("json.tmp");
        if let Err(err) = fs::write(&temp, payload).and_then(|_| fs::rename(&temp, &self.path)) {
            warn!(target: "server", path = %self.path.display(), error = %err, "failed to persist settings");
        }
    }
}

fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &trimmed[trimmed.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn masked_reads_hide_the_key() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"));
        store.update(SettingsUpdate {
            llm_api_key: Some("sk-verysecret-abcd".into()),
            llm_model: Some("gpt-4o-mini".into()),
            ..Default::default()
        });
        let masked = store.masked();
        assert_eq!(masked["llm_api_key"], "****abcd");
        assert_eq!(masked["llm_model"], "gpt-4o-mini");
        assert!(store.has_api_key());
    }

    #[test]
    fn settings_persist_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let store = SettingsStore::load(&path);
            store.update(SettingsUpdate {
                default_profile: Some("shopper".into()),
                ..Default::default()
            });
        }
        let store = SettingsStore::load(&path);
        assert_eq!(store.default_profile().unwrap(), "shopper");
        assert!(!store.has_api_key());
    }
}
