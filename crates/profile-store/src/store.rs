use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wheelhouse_core_types::SessionRequirements;

use crate::archive;
use crate::errors::ProfileError;
use crate::model::{ProfileIndex, ProfileRecord, ResolvedProfile, INDEX_VERSION};
use crate::resolver;
use crate::validate::{validate_user_data_dir, ValidationReport};

const INDEX_FILE: &str = "profiles.json";

/// Parameters for [`ProfileStore::create`].
#[derive(Clone, Debug, Default)]
pub struct NewProfile {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub auto_login_sites: Vec<String>,
    pub session_timeout_hours: Option<u32>,
}

impl NewProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Durable catalog of profiles rooted at `profiles_root`.
///
/// Reads are lock-free against an in-memory snapshot; every mutation is
/// serialized through a single writer lock and lands on disk via a
/// write-to-temp-then-rename sequence before the snapshot is refreshed.
#[derive(Debug)]
pub struct ProfileStore {
    profiles_root: PathBuf,
    index: RwLock<ProfileIndex>,
    writer: Mutex<()>,
}

impl ProfileStore {
    /// Open (or initialize) the store at `profiles_root`.
    pub fn open(profiles_root: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let profiles_root = profiles_root.into();
        fs::create_dir_all(&profiles_root).map_err(|e| ProfileError::UserDataDirUnwritable {
            path: profiles_root.clone(),
            reason: e.to_string(),
        })?;

        let index_path = profiles_root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let raw = fs::read(&index_path).map_err(|e| ProfileError::io("read index", e))?;
            serde_json::from_slice(&raw).map_err(|e| ProfileError::IndexCorrupt {
                path: index_path.clone(),
                reason: e.to_string(),
            })?
        } else {
            ProfileIndex::default()
        };

        info!(
            target: "profile-store",
            root = %profiles_root.display(),
            profiles = index.profiles.len(),
            "profile store opened"
        );

        Ok(Self {
            profiles_root,
            index: RwLock::new(index),
            writer: Mutex::new(()),
        })
    }

    pub fn profiles_root(&self) -> &Path {
        &self.profiles_root
    }

    pub fn index_path(&self) -> PathBuf {
        self.profiles_root.join(INDEX_FILE)
    }

    /// Create a profile and its user-data directory.
    pub fn create(&self, spec: NewProfile) -> Result<ProfileRecord, ProfileError> {
        validate_name(&spec.name)?;
        let user_data_dir = self.profiles_root.join(&spec.name);
        self.mutate(|index| {
            if index.profiles.contains_key(&spec.name) {
                return Err(ProfileError::AlreadyExists {
                    name: spec.name.clone(),
                });
            }
            fs::create_dir_all(&user_data_dir).map_err(|e| {
                ProfileError::UserDataDirUnwritable {
                    path: user_data_dir.clone(),
                    reason: e.to_string(),
                }
            })?;

            let mut record = ProfileRecord::new(&spec.name, user_data_dir.clone());
            record.description = spec.description.clone();
            record.tags = spec.tags.clone();
            record.auto_login_sites = spec.auto_login_sites.clone();
            if let Some(hours) = spec.session_timeout_hours {
                record.session_timeout_hours = hours;
            }
            index.profiles.insert(spec.name.clone(), record.clone());
            info!(target: "profile-store", profile = %spec.name, "profile created");
            Ok(record)
        })
    }

    pub fn get(&self, name: &str) -> Option<ProfileRecord> {
        self.index.read().profiles.get(name).cloned()
    }

    /// All profiles, optionally OR-filtered by tags.
    pub fn list(&self, filter_tags: Option<&[String]>) -> Vec<ProfileRecord> {
        let index = self.index.read();
        index
            .profiles
            .values()
            .filter(|p| match filter_tags {
                Some(tags) if !tags.is_empty() => p.has_any_tag(tags),
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// AND/OR tag search ordered by recency (never-used last).
    pub fn find_by_tags(&self, required_tags: &[String], match_all: bool) -> Vec<ProfileRecord> {
        let index = self.index.read();
        resolver::find_by_tags(&index.profiles, required_tags, match_all)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Keystone operation: pick a profile for the given requirements.
    pub fn resolve(
        &self,
        requirements: &SessionRequirements,
    ) -> Result<ResolvedProfile, ProfileError> {
        let index = self.index.read();
        resolver::resolve_from(&index.profiles, requirements)
    }

    /// Record a successful use: bumps `usage_count`, refreshes `last_used_at`.
    pub fn touch(&self, name: &str) -> Result<ProfileRecord, ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .get_mut(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            record.last_used_at = Some(Utc::now());
            record.usage_count += 1;
            Ok(record.clone())
        })
    }

    pub fn update_tags(&self, name: &str, tags: Vec<String>) -> Result<(), ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .get_mut(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            record.tags = tags;
            Ok(())
        })
    }

    pub fn update_browser_channel(
        &self,
        name: &str,
        channel: Option<String>,
    ) -> Result<(), ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .get_mut(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            record.browser_channel = channel;
            Ok(())
        })
    }

    pub fn mark_requires_human_login(
        &self,
        name: &str,
        requires_human: bool,
        notes: impl Into<String>,
    ) -> Result<(), ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .get_mut(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            record.requires_human_login = requires_human;
            record.login_notes = notes.into();
            Ok(())
        })
    }

    pub fn set_session_timeout(&self, name: &str, hours: u32) -> Result<(), ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .get_mut(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            record.session_timeout_hours = hours;
            Ok(())
        })
    }

    /// Delete a profile; the user-data directory is removed unless `keep_data`.
    pub fn delete(&self, name: &str, keep_data: bool) -> Result<(), ProfileError> {
        self.mutate(|index| {
            let record = index
                .profiles
                .remove(name)
                .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
            if !keep_data && record.user_data_dir.exists() {
                fs::remove_dir_all(&record.user_data_dir)
                    .map_err(|e| ProfileError::io("remove user data dir", e))?;
            }
            info!(target: "profile-store", profile = %name, keep_data, "profile deleted");
            Ok(())
        })
    }

    /// True iff the profile was used within its session timeout window.
    pub fn is_session_valid(&self, name: &str) -> bool {
        self.get(name)
            .map(|p| p.session_valid_at(Utc::now()))
            .unwrap_or(false)
    }

    /// Static validation report for a named profile.
    pub fn validate(&self, name: &str) -> Result<ValidationReport, ProfileError> {
        let profile = self
            .get(name)
            .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
        let static_checks = validate_user_data_dir(&profile.user_data_dir);
        Ok(ValidationReport::new(name, static_checks))
    }

    /// Export a profile (user-data directory + metadata) as a `.tar.gz`.
    pub fn export(&self, name: &str, export_path: &Path) -> Result<PathBuf, ProfileError> {
        let profile = self
            .get(name)
            .ok_or_else(|| ProfileError::NotFound { name: name.into() })?;
        let archive_path = archive::export_profile(&profile, export_path)?;
        info!(
            target: "profile-store",
            profile = %name,
            archive = %archive_path.display(),
            "profile exported"
        );
        Ok(archive_path)
    }

    /// Import a previously exported profile archive under `new_name` (or the
    /// archived name). Usage counters reset; `created_at` is the import time.
    pub fn import(
        &self,
        archive_path: &Path,
        new_name: Option<&str>,
    ) -> Result<ProfileRecord, ProfileError> {
        let staged = archive::read_archive_metadata(archive_path)?;
        let name = new_name
            .map(str::to_string)
            .or(staged.map(|p| p.name))
            .unwrap_or_else(|| "imported_profile".to_string());
        validate_name(&name)?;

        let user_data_dir = self.profiles_root.join(&name);
        self.mutate(|index| {
            if index.profiles.contains_key(&name) {
                return Err(ProfileError::AlreadyExists { name: name.clone() });
            }
            archive::extract_user_data(archive_path, &user_data_dir)?;

            let mut record = ProfileRecord::new(&name, user_data_dir.clone());
            record.description = "Imported profile".to_string();
            record.tags = vec!["imported".to_string()];
            index.profiles.insert(name.clone(), record.clone());
            info!(target: "profile-store", profile = %name, "profile imported");
            Ok(record)
        })
    }

    /// Snapshot of every profile, for diagnostics and the control plane.
    pub fn snapshot(&self) -> BTreeMap<String, ProfileRecord> {
        self.index.read().profiles.clone()
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut ProfileIndex) -> Result<T, ProfileError>,
    ) -> Result<T, ProfileError> {
        let _guard = self.writer.lock();
        let mut staged = self.index.read().clone();
        let out = apply(&mut staged)?;
        staged.version = INDEX_VERSION.to_string();
        let temp = self.stage_index_temp(&staged)?;
        self.commit_index_temp(&temp)?;
        *self.index.write() = staged;
        Ok(out)
    }

    /// Write the serialized index to a temp file next to the real one.
    ///
    /// Split from [`Self::commit_index_temp`] so the crash window between the
    /// two can be exercised directly by tests.
    fn stage_index_temp(&self, index: &ProfileIndex) -> Result<PathBuf, ProfileError> {
        let temp = self
            .profiles_root
            .join(format!(".{INDEX_FILE}.{}", Uuid::new_v4().simple()));
        let payload = serde_json::to_vec_pretty(index).map_err(|e| ProfileError::IndexCorrupt {
            path: temp.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&temp, payload).map_err(|e| ProfileError::io("write temp index", e))?;
        debug!(target: "profile-store", temp = %temp.display(), "index staged");
        Ok(temp)
    }

    /// Atomically replace the live index with the staged temp file.
    fn commit_index_temp(&self, temp: &Path) -> Result<(), ProfileError> {
        fs::rename(temp, self.index_path()).map_err(|e| ProfileError::io("rename index", e))
    }
}

// Names double as directory names under profiles_root; keep them flat.
fn validate_name(name: &str) -> Result<(), ProfileError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && name != INDEX_FILE;
    if ok {
        Ok(())
    } else {
        Err(ProfileError::InvalidName { name: name.into() })
    }
}

impl Drop for ProfileStore {
    fn drop(&mut self) {
        // Leftover temp files mean a crash happened between stage and commit;
        // they are harmless but noisy, so sweep on clean shutdown.
        if let Ok(entries) = fs::read_dir(&self.profiles_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(&format!(".{INDEX_FILE}.")) {
                    if fs::remove_file(entry.path()).is_err() {
                        warn!(
                            target: "profile-store",
                            file = %entry.path().display(),
                            "failed to sweep stale index temp file"
                        );
                    }
                }
            }
        }
    }
}
