use std::path::PathBuf;

use thiserror::Error;
use wheelhouse_driver::DriverError;
use wheelhouse_profile_store::ProfileError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A non-cloned session already holds this user-data directory.
    #[error("profile '{profile}' is busy (user data dir {path} is locked by another session)")]
    ProfileBusy { profile: String, path: PathBuf },

    #[error("session '{session}' not found")]
    NotFound { session: String },

    #[error("a script is already running on this session")]
    ScriptAlreadyRunning,

    #[error("session center is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("i/o failure during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ProfileBusy { .. } => "profile_busy",
            SessionError::NotFound { .. } => "session_not_found",
            SessionError::ScriptAlreadyRunning => "script_already_running",
            SessionError::ShuttingDown => "shutting_down",
            SessionError::Profile(err) => err.kind(),
            SessionError::Driver(err) => err.kind_str(),
            SessionError::Io { .. } => "io",
        }
    }
}
