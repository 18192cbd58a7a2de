use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::SessionId;
use wheelhouse_driver::BrowserDriver;
use wheelhouse_script_engine::RunnerHandle;

/// One interaction captured while recording is on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedStep {
    pub action: String,
    #[serde(flatten)]
    pub params: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct RecordingState {
    active: bool,
    steps: Vec<RecordedStep>,
}

/// A live session: one driver handle, its event channel, and bookkeeping
/// for profile exclusivity and recording.
pub struct SessionEntry {
    pub id: SessionId,
    pub driver: Arc<dyn BrowserDriver>,
    pub events: broadcast::Sender<RunnerEvent>,
    /// Resolved profile name, `None` for temporary sessions.
    pub profile_name: Option<String>,
    /// Directory actually backing the browser (live, clone, or temp).
    pub user_data_dir: PathBuf,
    /// Advisory-lock key held for non-cloned persistent profiles.
    pub(crate) lock_key: Option<PathBuf>,
    /// Owns throwaway directories so they disappear with the session.
    pub(crate) scratch_dir: Option<TempDir>,
    pub(crate) runner: Mutex<Option<Arc<RunnerHandle>>>,
    /// Per-session command serialization.
    pub(crate) command_lock: Arc<AsyncMutex<()>>,
    recording: Mutex<RecordingState>,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("profile_name", &self.profile_name)
            .field("user_data_dir", &self.user_data_dir)
            .finish_non_exhaustive()
    }
}

impl SessionEntry {
    pub(crate) fn new(
        id: SessionId,
        driver: Arc<dyn BrowserDriver>,
        profile_name: Option<String>,
        user_data_dir: PathBuf,
        lock_key: Option<PathBuf>,
        scratch_dir: Option<TempDir>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(512);
        Arc::new(Self {
            id,
            driver,
            events,
            profile_name,
            user_data_dir,
            lock_key,
            scratch_dir,
            runner: Mutex::new(None),
            command_lock: Arc::new(AsyncMutex::new(())),
            recording: Mutex::new(RecordingState::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Handle of the currently running script, if any.
    pub fn runner_handle(&self) -> Option<Arc<RunnerHandle>> {
        self.runner.lock().clone()
    }

    pub fn script_running(&self) -> bool {
        self.runner_handle()
            .map(|handle| handle.is_running())
            .unwrap_or(false)
    }

    /// Acquire the per-session command lock; callers hold the guard for the
    /// duration of one control command.
    pub async fn serialize_command(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.command_lock).lock_owned().await
    }

    pub fn start_recording(&self) {
        let mut recording = self.recording.lock();
        recording.active = true;
        recording.steps.clear();
    }

    pub fn stop_recording(&self) -> Vec<RecordedStep> {
        let mut recording = self.recording.lock();
        recording.active = false;
        std::mem::take(&mut recording.steps)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.lock().active
    }

    /// Capture one interaction if recording is on.
    pub fn record(&self, action: &str, params: Value) {
        let mut recording = self.recording.lock();
        if recording.active {
            recording.steps.push(RecordedStep {
                action: action.to_string(),
                params,
                timestamp: Utc::now(),
            });
        }
    }
}
