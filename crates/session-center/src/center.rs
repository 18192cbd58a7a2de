use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wheelhouse_artifact_store::ArtifactUploader;
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::{
    ErrorInfo, Script, ScriptResult, ScriptStatus, SessionId, SessionRequirements, Step,
    StepResult,
};
use wheelhouse_driver::{LaunchOptions, Viewport};
use wheelhouse_escalation::{EscalationEngine, ExecContext, VisionClient};
use wheelhouse_profile_store::{ProfileStore, ResolvedProfile};
use wheelhouse_script_engine::{
    CredentialProvider, ExecutorConfig, LoginGate, NoGate, RunnerConfig, ScriptRunner,
    StepExecutor,
};

use crate::entry::SessionEntry;
use crate::errors::SessionError;
use crate::factory::DriverFactory;

#[derive(Clone, Debug)]
pub struct CenterConfig {
    pub default_step_timeout: Duration,
    pub default_script_deadline: Duration,
    pub session_drain_deadline: Duration,
    pub max_vision_escalations_per_script: u64,
    pub default_browser_channel: Option<String>,
    pub default_viewport: Viewport,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(60),
            default_script_deadline: Duration::from_secs(1800),
            session_drain_deadline: Duration::from_secs(30),
            max_vision_escalations_per_script: 50,
            default_browser_channel: None,
            default_viewport: Viewport::default(),
        }
    }
}

/// Options for opening one session.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub headless: bool,
    pub requirements: SessionRequirements,
}

impl SessionOptions {
    pub fn headless(requirements: SessionRequirements) -> Self {
        Self {
            headless: true,
            requirements,
        }
    }
}

/// Exclusive owner of all live sessions.
pub struct SessionCenter {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    /// Advisory locks keyed by canonical user-data-dir path.
    profile_locks: DashMap<PathBuf, SessionId>,
    store: Arc<ProfileStore>,
    uploader: Arc<ArtifactUploader>,
    factory: Arc<dyn DriverFactory>,
    vision: Option<Arc<dyn VisionClient>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: CenterConfig,
    shutdown: CancellationToken,
}

impl SessionCenter {
    pub fn new(
        store: Arc<ProfileStore>,
        uploader: Arc<ArtifactUploader>,
        factory: Arc<dyn DriverFactory>,
        vision: Option<Arc<dyn VisionClient>>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        config: CenterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            profile_locks: DashMap::new(),
            store,
            uploader,
            factory,
            vision,
            credentials,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> Arc<ProfileStore> {
        Arc::clone(&self.store)
    }

    pub fn uploader(&self) -> Arc<ArtifactUploader> {
        Arc::clone(&self.uploader)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn lookup(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn for_each_live(&self, mut visit: impl FnMut(&Arc<SessionEntry>)) {
        for entry in self.sessions.iter() {
            visit(entry.value());
        }
    }

    /// Open a session: resolve the profile, enforce exclusivity, launch the
    /// browser.
    pub async fn open(&self, options: SessionOptions) -> Result<Arc<SessionEntry>, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }

        let resolved = self.store.resolve(&options.requirements)?;
        let session_id = SessionId::new();

        let (profile_name, user_data_dir, lock_key, scratch_dir, browser_channel) = match resolved {
            ResolvedProfile::Persistent {
                profile,
                clone_for_parallel,
            } => {
                let live_dir = canonical(&profile.user_data_dir);
                if clone_for_parallel {
                    // Throwaway copy: always admitted, changes do not persist.
                    let scratch = TempDir::with_prefix("wheelhouse-clone-")
                        .map_err(|e| SessionError::io("create clone dir", e))?;
                    copy_dir(&profile.user_data_dir, scratch.path())?;
                    debug!(
                        target: "session-center",
                        profile = %profile.name,
                        clone = %scratch.path().display(),
                        "profile cloned for parallel session"
                    );
                    (
                        Some(profile.name.clone()),
                        scratch.path().to_path_buf(),
                        None,
                        Some(scratch),
                        profile.browser_channel.clone(),
                    )
                } else {
                    // Live directory: exactly one session may hold it.
                    let vacant = self
                        .profile_locks
                        .entry(live_dir.clone())
                        .or_insert_with(|| session_id.clone());
                    if *vacant.value() != session_id {
                        return Err(SessionError::ProfileBusy {
                            profile: profile.name.clone(),
                            path: live_dir,
                        });
                    }
                    drop(vacant);
                    // Usage accounting only for sessions that persist state.
                    if let Err(err) = self.store.touch(&profile.name) {
                        warn!(target: "session-center", error = %err, "profile touch failed");
                    }
                    (
                        Some(profile.name.clone()),
                        profile.user_data_dir.clone(),
                        Some(live_dir),
                        None,
                        profile.browser_channel.clone(),
                    )
                }
            }
            ResolvedProfile::Temporary => {
                let scratch = TempDir::with_prefix("wheelhouse-temp-")
                    .map_err(|e| SessionError::io("create temp profile", e))?;
                (None, scratch.path().to_path_buf(), None, Some(scratch), None)
            }
        };

        let launch = LaunchOptions {
            headless: options.headless
                && !options.requirements.requires_human_login,
            user_data_dir: user_data_dir.clone(),
            browser_channel: options
                .requirements
                .browser_channel
                .clone()
                .or(browser_channel)
                .or_else(|| self.config.default_browser_channel.clone()),
            viewport: self.config.default_viewport,
            ..Default::default()
        };

        let driver = match self.factory.launch(launch).await {
            Ok(driver) => driver,
            Err(err) => {
                if let Some(key) = &lock_key {
                    self.profile_locks.remove(key);
                }
                return Err(SessionError::Driver(err));
            }
        };

        let entry = SessionEntry::new(
            session_id.clone(),
            driver,
            profile_name,
            user_data_dir,
            lock_key,
            scratch_dir,
        );
        self.sessions.insert(session_id.clone(), Arc::clone(&entry));
        info!(
            target: "session-center",
            session = %session_id,
            profile = entry.profile_name.as_deref().unwrap_or("<temporary>"),
            "session opened"
        );
        Ok(entry)
    }

    /// Close and forget a session. Idempotent: closing twice is a no-op.
    pub async fn close(&self, id: &SessionId) -> Result<bool, SessionError> {
        let Some((_, entry)) = self.sessions.remove(id) else {
            return Ok(false);
        };

        if let Some(handle) = entry.runner_handle() {
            handle.stop();
        }
        if let Err(err) = entry.driver.close().await {
            warn!(target: "session-center", session = %id, error = %err, "driver close failed");
        }
        if let Some(key) = &entry.lock_key {
            self.profile_locks.remove(key);
        }
        info!(target: "session-center", session = %id, "session closed");
        Ok(true)
    }

    /// Build the per-run execution stack for a session.
    fn build_runner(&self, entry: &Arc<SessionEntry>, gate: Arc<dyn LoginGate>) -> ScriptRunner {
        let engine = Arc::new(
            EscalationEngine::new(Arc::clone(&entry.driver), self.vision.clone())
                .with_vision_budget(self.config.max_vision_escalations_per_script),
        );
        let mut executor = StepExecutor::new(
            Arc::clone(&entry.driver),
            engine,
            Arc::clone(&self.uploader),
            entry.id.clone(),
            entry.events.clone(),
            ExecutorConfig {
                default_step_timeout: self.config.default_step_timeout,
                profile_name: entry.profile_name.clone(),
                user_data_dir: Some(entry.user_data_dir.clone()),
            },
        );
        if let Some(credentials) = &self.credentials {
            executor = executor.with_credentials(Arc::clone(credentials));
        }
        ScriptRunner::new(
            executor,
            entry.id.clone(),
            entry.events.clone(),
            RunnerConfig {
                script_deadline: self.config.default_script_deadline,
            },
        )
        .with_login_gate(gate)
    }

    /// Run a script on a session. The runner task is supervised: a panic
    /// surfaces as a `runner_crash` error result instead of a dead session
    /// taking others down.
    pub async fn run_script(
        &self,
        entry: &Arc<SessionEntry>,
        script: Script,
        gate: Option<Arc<dyn LoginGate>>,
    ) -> Result<ScriptResult, SessionError> {
        let runner = self.build_runner(entry, gate.unwrap_or_else(|| Arc::new(NoGate)));
        {
            // Claim the run slot atomically so two scripts can never race in.
            let mut slot = entry.runner.lock();
            if slot.is_some() {
                return Err(SessionError::ScriptAlreadyRunning);
            }
            *slot = Some(runner.handle());
        }

        let session_id = entry.id.clone();
        let script_name = script.name.clone();
        let task = tokio::spawn(async move { runner.run(&script).await });
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(
                    target: "session-center",
                    session = %session_id,
                    error = %join_error,
                    "script runner crashed"
                );
                let _ = entry.events.send(RunnerEvent::ScriptError {
                    step_index: None,
                    error: ErrorInfo::new("runner_crash", join_error.to_string()),
                });
                ScriptResult {
                    status: ScriptStatus::Error,
                    script_name,
                    session_id: session_id.clone(),
                    step_results: Vec::new(),
                    duration_ms: 0,
                    execution_stats: Default::default(),
                    artifacts: Vec::new(),
                    error: Some(ErrorInfo::new("runner_crash", join_error.to_string())),
                }
            }
        };

        *entry.runner.lock() = None;
        Ok(result)
    }

    /// Execute one ad-hoc step, reserved for sessions with no running script.
    pub async fn execute_single_step(
        &self,
        entry: &Arc<SessionEntry>,
        step: Step,
    ) -> Result<StepResult, SessionError> {
        if entry.runner.lock().is_some() {
            return Err(SessionError::ScriptAlreadyRunning);
        }
        let runner = self.build_runner(entry, Arc::new(NoGate));
        Ok(runner
            .executor()
            .execute(0, &step, &ExecContext::new())
            .await)
    }

    /// Graceful shutdown: stop every runner, then close sessions within the
    /// drain deadline; whatever is left gets force-released.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(
            target: "session-center",
            sessions = ids.len(),
            "draining sessions for shutdown"
        );

        for id in &ids {
            if let Some(entry) = self.lookup(id) {
                if let Some(handle) = entry.runner_handle() {
                    handle.stop();
                }
            }
        }

        let drain = self.config.session_drain_deadline;
        for id in ids {
            let closed = tokio::time::timeout(drain, self.close(&id)).await;
            match closed {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(target: "session-center", session = %id, error = %err, "close failed at shutdown");
                }
                Err(_) => {
                    warn!(target: "session-center", session = %id, "drain deadline hit, force releasing");
                    if let Some((_, entry)) = self.sessions.remove(&id) {
                        if let Some(key) = &entry.lock_key {
                            self.profile_locks.remove(key);
                        }
                    }
                }
            }
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn copy_dir(source: &Path, dest: &Path) -> Result<(), SessionError> {
    let mut stack = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to).map_err(|e| SessionError::io("clone profile dir", e))?;
        let entries = fs::read_dir(&from).map_err(|e| SessionError::io("clone profile dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SessionError::io("clone profile dir", e))?;
            let target = to.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|e| SessionError::io("clone profile dir", e))?;
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                fs::copy(entry.path(), target)
                    .map_err(|e| SessionError::io("clone profile dir", e))?;
            }
            // Sockets and symlinks inside profile dirs are skipped; Chromium
            // recreates what it needs.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::StubFactory;
    use tempfile::tempdir;
    use wheelhouse_core_types::{LocatorSpec, StepKind};
    use wheelhouse_profile_store::NewProfile;

    struct Harness {
        _root: tempfile::TempDir,
        center: Arc<SessionCenter>,
        store: Arc<ProfileStore>,
    }

    fn harness() -> Harness {
        harness_with_factory(Arc::new(StubFactory::new()))
    }

    fn harness_with_factory(factory: Arc<dyn DriverFactory>) -> Harness {
        let root = tempdir().unwrap();
        let store = Arc::new(ProfileStore::open(root.path().join("profiles")).unwrap());
        let uploader = Arc::new(ArtifactUploader::disabled());
        let center = SessionCenter::new(
            Arc::clone(&store),
            uploader,
            factory,
            None,
            None,
            CenterConfig::default(),
        );
        Harness {
            _root: root,
            center,
            store,
        }
    }

    #[tokio::test]
    async fn open_and_close_temporary_session() {
        let h = harness();
        let entry = h
            .center
            .open(SessionOptions::default())
            .await
            .unwrap();
        assert!(entry.profile_name.is_none());
        assert_eq!(h.center.session_count(), 1);
        assert!(h.center.close(&entry.id).await.unwrap());
        assert!(!h.center.close(&entry.id).await.unwrap());
        assert_eq!(h.center.session_count(), 0);
    }

    #[tokio::test]
    async fn second_non_cloned_session_on_same_profile_is_rejected() {
        let h = harness();
        h.store.create(NewProfile::named("shared")).unwrap();

        let requirements = SessionRequirements::named("shared");
        let first = h
            .center
            .open(SessionOptions::headless(requirements.clone()))
            .await
            .unwrap();

        let err = h
            .center
            .open(SessionOptions::headless(requirements.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProfileBusy { .. }));

        // A cloned session against the same profile is always admitted.
        let mut cloned = requirements;
        cloned.clone_for_parallel = true;
        let second = h
            .center
            .open(SessionOptions::headless(cloned))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(first.user_data_dir, second.user_data_dir);

        h.center.close(&first.id).await.unwrap();
        h.center.close(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn lock_releases_on_close() {
        let h = harness();
        h.store.create(NewProfile::named("serial")).unwrap();
        let requirements = SessionRequirements::named("serial");

        let first = h
            .center
            .open(SessionOptions::headless(requirements.clone()))
            .await
            .unwrap();
        h.center.close(&first.id).await.unwrap();

        // Released lock admits the next session.
        let second = h
            .center
            .open(SessionOptions::headless(requirements))
            .await
            .unwrap();
        h.center.close(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn cloned_sessions_do_not_touch_usage() {
        let h = harness();
        h.store.create(NewProfile::named("tracked")).unwrap();

        let mut cloned = SessionRequirements::named("tracked");
        cloned.clone_for_parallel = true;
        let entry = h
            .center
            .open(SessionOptions::headless(cloned))
            .await
            .unwrap();
        assert_eq!(h.store.get("tracked").unwrap().usage_count, 0);
        h.center.close(&entry.id).await.unwrap();

        let live = h
            .center
            .open(SessionOptions::headless(SessionRequirements::named(
                "tracked",
            )))
            .await
            .unwrap();
        assert_eq!(h.store.get("tracked").unwrap().usage_count, 1);
        h.center.close(&live.id).await.unwrap();
    }

    #[tokio::test]
    async fn run_script_rejects_concurrent_scripts() {
        let factory = Arc::new(StubFactory::with(|driver| {
            driver.set_op_delay(Duration::from_millis(40));
            driver.with_element("#b")
        }));
        let h = harness_with_factory(factory);
        let entry = h.center.open(SessionOptions::default()).await.unwrap();

        let script = Script::new(
            "long",
            vec![
                Step::new(StepKind::Click {
                    locator: Some(LocatorSpec::selector("#b")),
                    escalation: None,
                }),
                Step::new(StepKind::Click {
                    locator: Some(LocatorSpec::selector("#b")),
                    escalation: None,
                }),
            ],
        );

        let center = Arc::clone(&h.center);
        let entry_clone = Arc::clone(&entry);
        let script_clone = script.clone();
        let running = tokio::spawn(async move {
            center.run_script(&entry_clone, script_clone, None).await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = h.center.run_script(&entry, script, None).await;
        assert!(matches!(err, Err(SessionError::ScriptAlreadyRunning)));

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.status, ScriptStatus::Completed);
        h.center.close(&entry.id).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_every_session() {
        let h = harness();
        let a = h.center.open(SessionOptions::default()).await.unwrap();
        let b = h.center.open(SessionOptions::default()).await.unwrap();
        assert_eq!(h.center.session_count(), 2);

        h.center.shutdown_all().await;
        assert_eq!(h.center.session_count(), 0);

        // New sessions are refused after shutdown begins.
        let err = h.center.open(SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::ShuttingDown));
        drop((a, b));
    }
}
