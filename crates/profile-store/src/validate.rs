use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a user-data directory after static inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Warn,
    Missing,
}

/// Filesystem-only checks over a Chromium user-data directory.
///
/// Recognizes both the legacy cookie layout (`Default/Cookies`) and the
/// modern one (`Default/Network/Cookies`), and tolerates paths that point
/// directly at a profile directory instead of the user-data root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticValidation {
    pub path: Option<PathBuf>,
    pub path_exists: bool,
    pub has_default_dir: bool,
    pub has_cookies_db: bool,
    pub has_local_storage: bool,
    pub has_preferences: bool,
    pub has_local_state: bool,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub status: ValidationStatus,
}

impl StaticValidation {
    fn missing(path: Option<PathBuf>) -> Self {
        Self {
            path,
            path_exists: false,
            has_default_dir: false,
            has_cookies_db: false,
            has_local_storage: false,
            has_preferences: false,
            has_local_state: false,
            size_bytes: 0,
            last_modified: None,
            status: ValidationStatus::Missing,
        }
    }

    /// At least one artifact that typically carries authentication state.
    pub fn has_auth_indicators(&self) -> bool {
        self.has_cookies_db || self.has_local_storage
    }
}

/// Browser-backed checks run by the `validate_profile` step in runtime mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeValidation {
    /// Verdict of the textual UI probe, when one was requested.
    pub ui_ok: Option<bool>,
    pub cookies_ok: Option<bool>,
    pub local_storage_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies_found: Vec<String>,
}

/// Combined report returned by `validate(name, mode)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub profile: String,
    #[serde(rename = "static")]
    pub static_checks: StaticValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeValidation>,
    pub recommendations: Vec<String>,
}

impl ValidationReport {
    pub fn new(profile: impl Into<String>, static_checks: StaticValidation) -> Self {
        let mut report = Self {
            profile: profile.into(),
            static_checks,
            runtime: None,
            recommendations: Vec::new(),
        };
        report.refresh_recommendations();
        report
    }

    pub fn with_runtime(mut self, runtime: RuntimeValidation) -> Self {
        self.runtime = Some(runtime);
        self.refresh_recommendations();
        self
    }

    fn refresh_recommendations(&mut self) {
        let mut recs = Vec::new();
        match self.static_checks.status {
            ValidationStatus::Missing => recs.push(
                "Profile directory missing or incomplete; run the human login bootstrap."
                    .to_string(),
            ),
            ValidationStatus::Warn => recs.push(
                "Profile present but no auth artifacts found; validate at runtime.".to_string(),
            ),
            ValidationStatus::Ok => {}
        }
        if let Some(runtime) = &self.runtime {
            if runtime.ui_ok == Some(false) {
                recs.push("UI probe reports logged-out state; refresh the login.".to_string());
            }
            if runtime.cookies_ok == Some(false) {
                recs.push("Expected cookies are absent; the session likely expired.".to_string());
            }
        }
        recs.push(
            "Keep clone_for_parallel=false to persist sessions; clone only for parallel runs."
                .to_string(),
        );
        self.recommendations = recs;
    }
}

/// Static validation of a Chromium user-data directory.
pub fn validate_user_data_dir(user_data_dir: &Path) -> StaticValidation {
    if !user_data_dir.exists() {
        return StaticValidation::missing(Some(user_data_dir.to_path_buf()));
    }

    let default_dir = user_data_dir.join("Default");
    let has_default_dir = default_dir.is_dir();

    // Candidate profile directories: the Default subtree, or the path itself
    // when it already points at a profile directory.
    let mut candidates: Vec<PathBuf> = Vec::new();
    if has_default_dir {
        candidates.push(default_dir);
    }
    if user_data_dir.join("Preferences").exists()
        || user_data_dir.join("Network").exists()
        || user_data_dir.join("Cookies").exists()
    {
        candidates.push(user_data_dir.to_path_buf());
    }

    let first_existing = |mk: &dyn Fn(&PathBuf) -> PathBuf| -> bool {
        candidates.iter().map(mk).any(|p| p.exists())
    };

    let has_cookies_db = first_existing(&|d| d.join("Network").join("Cookies"))
        || first_existing(&|d| d.join("Cookies"));
    let has_local_storage = first_existing(&|d| d.join("Local Storage").join("leveldb"));
    let has_preferences = first_existing(&|d| d.join("Preferences"));
    let has_local_state = user_data_dir.join("Local State").exists();

    let (size_bytes, last_modified) = walk_stats(user_data_dir);

    let mut status = if has_default_dir || has_local_state {
        ValidationStatus::Ok
    } else {
        ValidationStatus::Missing
    };
    if status == ValidationStatus::Ok && !(has_cookies_db || has_local_storage) {
        status = ValidationStatus::Warn;
    }

    StaticValidation {
        path: Some(user_data_dir.to_path_buf()),
        path_exists: true,
        has_default_dir,
        has_cookies_db,
        has_local_storage,
        has_preferences,
        has_local_state,
        size_bytes,
        last_modified,
        status,
    }
}

fn walk_stats(root: &Path) -> (u64, Option<DateTime<Utc>>) {
    let mut size = 0u64;
    let mut newest: Option<SystemTime> = None;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                size += meta.len();
                if let Ok(modified) = meta.modified() {
                    if newest.map(|n| modified > n).unwrap_or(true) {
                        newest = Some(modified);
                    }
                }
            }
        }
    }
    (size, newest.map(DateTime::<Utc>::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn absent_directory_is_missing() {
        let report = validate_user_data_dir(Path::new("/definitely/not/here"));
        assert_eq!(report.status, ValidationStatus::Missing);
        assert!(!report.path_exists);
    }

    #[test]
    fn default_subtree_without_auth_artifacts_warns() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Default")).unwrap();
        fs::write(dir.path().join("Local State"), b"{}").unwrap();
        let report = validate_user_data_dir(dir.path());
        assert_eq!(report.status, ValidationStatus::Warn);
        assert!(report.has_default_dir);
        assert!(!report.has_auth_indicators());
    }

    #[test]
    fn modern_cookie_layout_is_recognized() {
        let dir = tempdir().unwrap();
        let network = dir.path().join("Default").join("Network");
        fs::create_dir_all(&network).unwrap();
        fs::write(network.join("Cookies"), b"sqlite").unwrap();
        let report = validate_user_data_dir(dir.path());
        assert_eq!(report.status, ValidationStatus::Ok);
        assert!(report.has_cookies_db);
    }

    #[test]
    fn legacy_cookie_layout_is_recognized() {
        let dir = tempdir().unwrap();
        let default = dir.path().join("Default");
        fs::create_dir_all(&default).unwrap();
        fs::write(default.join("Cookies"), b"sqlite").unwrap();
        fs::create_dir_all(default.join("Local Storage").join("leveldb")).unwrap();
        let report = validate_user_data_dir(dir.path());
        assert_eq!(report.status, ValidationStatus::Ok);
        assert!(report.has_cookies_db);
        assert!(report.has_local_storage);
        assert!(report.size_bytes > 0);
        assert!(report.last_modified.is_some());
    }

    #[test]
    fn report_recommendations_follow_status() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Default")).unwrap();
        let static_checks = validate_user_data_dir(dir.path());
        let report = ValidationReport::new("demo", static_checks);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("validate at runtime")));
    }
}
