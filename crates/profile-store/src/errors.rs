use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a profile failed to satisfy a tag request, reported per profile so the
/// caller can see what is missing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileMiss {
    pub name: String,
    pub tags: Vec<String>,
    pub missing_tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("'{name}' is not a valid profile name")]
    InvalidName { name: String },

    #[error("profile '{name}' not found")]
    NotFound { name: String },

    #[error("no suitable profile for tags {required_tags:?}")]
    NoSuitableProfile {
        required_tags: Vec<String>,
        available: Vec<ProfileMiss>,
    },

    #[error("profile index at {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("user data directory {path} is not writable: {reason}")]
    UserDataDirUnwritable { path: PathBuf, reason: String },

    #[error("archive operation failed: {0}")]
    Archive(String),

    #[error("i/o failure during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ProfileError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Stable kind string surfaced to observers and API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ProfileError::AlreadyExists { .. } => "already_exists",
            ProfileError::InvalidName { .. } => "invalid_name",
            ProfileError::NotFound { .. } => "not_found",
            ProfileError::NoSuitableProfile { .. } => "no_suitable_profile",
            ProfileError::IndexCorrupt { .. } => "index_corrupt",
            ProfileError::UserDataDirUnwritable { .. } => "user_data_dir_unwritable",
            ProfileError::Archive(_) => "archive",
            ProfileError::Io { .. } => "io",
        }
    }
}
