use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Index schema version written to `profiles.json`.
pub const INDEX_VERSION: &str = "1.0";

/// One persisted browser identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub auto_login_sites: Vec<String>,
    pub user_data_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub requires_human_login: bool,
    #[serde(default)]
    pub login_notes: String,
    #[serde(default = "default_session_timeout_hours")]
    pub session_timeout_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_channel: Option<String>,
}

fn default_session_timeout_hours() -> u32 {
    24
}

impl ProfileRecord {
    pub fn new(name: impl Into<String>, user_data_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            auto_login_sites: Vec::new(),
            user_data_dir,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            requires_human_login: false,
            login_notes: String::new(),
            session_timeout_hours: default_session_timeout_hours(),
            browser_channel: None,
        }
    }

    pub fn has_all_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }

    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|tag| self.tags.contains(tag))
    }

    pub fn missing_tags(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|tag| !self.tags.contains(*tag))
            .cloned()
            .collect()
    }

    /// True while `now - last_used_at` is inside the session timeout window.
    pub fn session_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_used_at {
            Some(last) => now - last < Duration::hours(self.session_timeout_hours as i64),
            None => false,
        }
    }

    pub fn lifecycle_at(&self, now: DateTime<Utc>) -> ProfileLifecycle {
        if self.last_used_at.is_none() {
            ProfileLifecycle::Defined
        } else if self.session_valid_at(now) {
            ProfileLifecycle::LoggedIn
        } else {
            ProfileLifecycle::SessionExpired
        }
    }
}

/// Where a profile sits in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLifecycle {
    Defined,
    LoggedIn,
    SessionExpired,
}

/// On-disk index: `{ version, profiles: { name -> record } }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileIndex {
    pub version: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileRecord>,
}

impl Default for ProfileIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

/// Outcome of a resolution request.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedProfile {
    /// A catalogued profile; `clone_for_parallel` carries the caller's copy
    /// policy through to the session layer.
    Persistent {
        profile: ProfileRecord,
        clone_for_parallel: bool,
    },
    /// Fresh throwaway user-data directory, nothing persists.
    Temporary,
}

impl ResolvedProfile {
    pub fn profile_name(&self) -> Option<&str> {
        match self {
            ResolvedProfile::Persistent { profile, .. } => Some(&profile.name),
            ResolvedProfile::Temporary => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ResolvedProfile::Temporary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_last_use() {
        let mut record = ProfileRecord::new("shopper", PathBuf::from("/tmp/x"));
        let now = Utc::now();
        assert_eq!(record.lifecycle_at(now), ProfileLifecycle::Defined);

        record.last_used_at = Some(now - Duration::hours(1));
        assert_eq!(record.lifecycle_at(now), ProfileLifecycle::LoggedIn);

        record.last_used_at = Some(now - Duration::hours(48));
        assert_eq!(record.lifecycle_at(now), ProfileLifecycle::SessionExpired);
    }

    #[test]
    fn tag_queries() {
        let mut record = ProfileRecord::new("p", PathBuf::from("/tmp/p"));
        record.tags = vec!["banking".into(), "production".into()];
        assert!(record.has_all_tags(&["banking".into()]));
        assert!(!record.has_all_tags(&["banking".into(), "staging".into()]));
        assert!(record.has_any_tag(&["staging".into(), "production".into()]));
        assert_eq!(
            record.missing_tags(&["banking".into(), "staging".into()]),
            vec!["staging".to_string()]
        );
    }
}
