//! Consolidated per-tool secret source.
//!
//! One JSON document maps tool names to credential objects:
//! `{ "google-maps": { "api_key": "..." }, "broadband-portal": { ... } }`.
//! The control plane injects the sub-object matching a step's tool tag; a
//! missing entry is logged and the step proceeds without credentials.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};
use wheelhouse_script_engine::CredentialProvider;

/// Reads the consolidated secret from a file, caching the parsed document.
pub struct FileSecretSource {
    path: PathBuf,
    cached: RwLock<Option<Value>>,
}

impl FileSecretSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    fn document(&self) -> Option<Value> {
        if let Some(cached) = self.cached.read().clone() {
            return Some(cached);
        }
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target: "secrets",
                    path = %self.path.display(),
                    error = %err,
                    "consolidated secret unreadable"
                );
                return None;
            }
        };
        match serde_json::from_slice::<Value>(&raw) {
            Ok(parsed) => {
                *self.cached.write() = Some(parsed.clone());
                Some(parsed)
            }
            Err(err) => {
                warn!(
                    target: "secrets",
                    path = %self.path.display(),
                    error = %err,
                    "consolidated secret is not valid JSON"
                );
                None
            }
        }
    }

    /// Drop the cache so the next lookup re-reads the file.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

impl CredentialProvider for FileSecretSource {
    fn credentials_for(&self, tool_name: &str) -> Option<Value> {
        let document = self.document()?;
        match document.get(tool_name) {
            Some(section) if !section.is_null() => {
                let fields: Vec<&str> = section
                    .as_object()
                    .map(|m| m.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                info!(target: "secrets", tool = tool_name, ?fields, "credentials resolved");
                Some(section.clone())
            }
            _ => {
                info!(target: "secrets", tool = tool_name, "no credentials configured");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn resolves_tool_sections_and_tolerates_misses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool-secrets.json");
        fs::write(
            &path,
            serde_json::to_vec(&json!({
                "maps": { "api_key": "k-123" },
            }))
            .unwrap(),
        )
        .unwrap();

        let source = FileSecretSource::new(&path);
        let maps = source.credentials_for("maps").unwrap();
        assert_eq!(maps["api_key"], "k-123");
        assert!(source.credentials_for("unknown-tool").is_none());
    }

    #[test]
    fn unreadable_file_is_a_silent_miss() {
        let source = FileSecretSource::new("/no/such/secret.json");
        assert!(source.credentials_for("anything").is_none());
    }
}
