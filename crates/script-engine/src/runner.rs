use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::{
    ErrorInfo, EscalationMethod, MethodSpec, Script, ScriptResult, ScriptStatus, SessionId, Step,
    StepKind, StepResult,
};
use wheelhouse_escalation::ExecContext;

use crate::executor::StepExecutor;
use crate::gate::{LoginGate, NoGate};

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Wall-clock bound for the whole script; expiry acts as a synthetic stop
    /// and surfaces as a `deadline_exceeded` error result.
    pub script_deadline: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            script_deadline: Duration::from_secs(1800),
        }
    }
}

/// Shared control surface for a running script.
///
/// `pause` lets the in-flight step finish and parks the loop; `stop` clears
/// both flags and ends the run after the in-flight step. Both are idempotent.
pub struct RunnerHandle {
    running: AtomicBool,
    paused: AtomicBool,
    stop: CancellationToken,
    pause_changed: Notify,
    events: broadcast::Sender<RunnerEvent>,
}

impl RunnerHandle {
    fn new(events: broadcast::Sender<RunnerEvent>) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop: CancellationToken::new(),
            pause_changed: Notify::new(),
            events,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) -> bool {
        if !self.is_running() || self.stop.is_cancelled() {
            return false;
        }
        self.paused.store(true, Ordering::SeqCst);
        self.pause_changed.notify_waiters();
        let _ = self.events.send(RunnerEvent::ScriptPaused);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.pause_changed.notify_waiters();
        let _ = self.events.send(RunnerEvent::ScriptResumed);
        true
    }

    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.stop.cancel();
        self.pause_changed.notify_waiters();
        let _ = self.events.send(RunnerEvent::ScriptStopped);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }
}

/// Linearly drives a script's steps against one session.
pub struct ScriptRunner {
    executor: StepExecutor,
    session_id: SessionId,
    events: broadcast::Sender<RunnerEvent>,
    handle: Arc<RunnerHandle>,
    login_gate: Arc<dyn LoginGate>,
    config: RunnerConfig,
}

impl ScriptRunner {
    pub fn new(
        executor: StepExecutor,
        session_id: SessionId,
        events: broadcast::Sender<RunnerEvent>,
        config: RunnerConfig,
    ) -> Self {
        let handle = RunnerHandle::new(events.clone());
        Self {
            executor,
            session_id,
            events,
            handle,
            login_gate: Arc::new(NoGate),
            config,
        }
    }

    pub fn with_login_gate(mut self, gate: Arc<dyn LoginGate>) -> Self {
        self.login_gate = gate;
        self
    }

    pub fn handle(&self) -> Arc<RunnerHandle> {
        Arc::clone(&self.handle)
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Execute the script to completion. Always yields a [`ScriptResult`];
    /// the handle controls pause/resume/stop concurrently.
    pub async fn run(&self, script: &Script) -> ScriptResult {
        let started = Instant::now();
        let deadline = started + self.config.script_deadline;
        self.handle.running.store(true, Ordering::SeqCst);
        self.handle.paused.store(false, Ordering::SeqCst);

        let _ = self.events.send(RunnerEvent::ScriptStarted {
            script_name: script.name.clone(),
        });
        info!(
            target: "script-engine",
            script = %script.name,
            steps = script.steps.len(),
            "script started"
        );

        let context = ExecContext::new();
        let mut step_results: Vec<StepResult> = Vec::new();
        let mut status = ScriptStatus::Completed;
        let mut script_error: Option<ErrorInfo> = None;

        // Starting page runs as a pseudo-step at index -1.
        if let Some(url) = &script.starting_page {
            let pseudo = Step::new(StepKind::Navigate {
                url: url.clone(),
                wait_until: Default::default(),
                timeout: None,
            })
            .describe("Navigate to starting page");
            let _ = self.events.send(RunnerEvent::step_start(
                -1,
                "navigate",
                pseudo.description.clone(),
            ));
            let mut result = self.executor.execute(-1, &pseudo, &context).await;

            if result.is_success() && script.session.wait_for_human_login {
                result.output = self.await_human_login(script, &context, result.output).await;
            }

            let failed = !result.is_success();
            let error = result.error.clone();
            let _ = self
                .events
                .send(RunnerEvent::step_complete(-1, result.clone()));
            step_results.push(result);

            if failed && script.abort_on_error {
                return self
                    .finish(
                        script,
                        ScriptStatus::Aborted,
                        error,
                        step_results,
                        started,
                    )
                    .await;
            }
        }

        for (index, step) in script.steps.iter().enumerate() {
            let index = index as i64;

            if self.handle.stop.is_cancelled() {
                status = ScriptStatus::Stopped;
                break;
            }
            if Instant::now() >= deadline {
                warn!(target: "script-engine", script = %script.name, "script deadline exceeded");
                status = ScriptStatus::Error;
                script_error = Some(ErrorInfo::new(
                    "deadline_exceeded",
                    format!(
                        "script exceeded its {}s deadline",
                        self.config.script_deadline.as_secs()
                    ),
                ));
                break;
            }
            if !self.wait_while_paused().await {
                status = ScriptStatus::Stopped;
                break;
            }

            let _ = self.events.send(RunnerEvent::step_start(
                index,
                step.action(),
                step.description.clone(),
            ));
            let result = self.executor.execute(index, step, &context).await;
            let failed = !result.is_success();
            let error = result.error.clone();
            let _ = self
                .events
                .send(RunnerEvent::step_complete(index, result.clone()));
            step_results.push(result);

            // A closed browser context is fatal regardless of abort policy:
            // the session is gone, nothing further can execute.
            let driver_dead = error
                .as_ref()
                .map(|e| e.kind == "context_closed")
                .unwrap_or(false);
            if driver_dead {
                warn!(target: "script-engine", script = %script.name, "browser context lost");
                status = ScriptStatus::Error;
                script_error = error;
                break;
            }
            if failed && script.abort_on_error {
                status = ScriptStatus::Aborted;
                script_error = error;
                break;
            }
        }

        self.finish(script, status, script_error, step_results, started)
            .await
    }

    /// Block while paused; false means a stop arrived instead of a resume.
    async fn wait_while_paused(&self) -> bool {
        while self.handle.is_paused() {
            if self.handle.stop.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = self.handle.pause_changed.notified() => {}
                _ = self.handle.stop.cancelled() => return false,
            }
        }
        !self.handle.stop.is_cancelled()
    }

    async fn await_human_login(
        &self,
        script: &Script,
        context: &ExecContext,
        output: Value,
    ) -> Value {
        info!(
            target: "script-engine",
            script = %script.name,
            "waiting for human login"
        );
        self.login_gate.wait_for_login().await;

        let mut output = match output {
            Value::Object(map) => Value::Object(map),
            other => json!({ "previous": other }),
        };
        if let Some(prompt) = &script.session.post_login_verification {
            let chain = vec![EscalationMethod::new(MethodSpec::VisionDecide {
                prompt: prompt.clone(),
                schema: Some(json!({ "type": "object" })),
            })];
            let verified = match self.executor.engine().run_chain(&chain, context).await {
                Ok(success) => success
                    .data
                    .as_bool()
                    .or_else(|| success.data.get("answer").and_then(Value::as_bool))
                    .unwrap_or(false),
                Err(err) => {
                    warn!(target: "script-engine", error = %err, "login verification failed");
                    false
                }
            };
            output["login_verified"] = Value::Bool(verified);
        }
        output
    }

    async fn finish(
        &self,
        script: &Script,
        status: ScriptStatus,
        error: Option<ErrorInfo>,
        step_results: Vec<StepResult>,
        started: Instant,
    ) -> ScriptResult {
        let artifacts = step_results
            .iter()
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect();

        let result = ScriptResult {
            status,
            script_name: script.name.clone(),
            session_id: self.session_id.clone(),
            step_results,
            duration_ms: started.elapsed().as_millis() as u64,
            execution_stats: self.executor.engine().stats(),
            artifacts,
            error,
        };

        self.handle.running.store(false, Ordering::SeqCst);
        self.handle.paused.store(false, Ordering::SeqCst);

        if result.status == ScriptStatus::Error {
            if let Some(error) = &result.error {
                let _ = self.events.send(RunnerEvent::ScriptError {
                    step_index: None,
                    error: error.clone(),
                });
            }
        }
        let _ = self.events.send(RunnerEvent::ScriptComplete {
            result: result.clone(),
        });
        info!(
            target: "script-engine",
            script = %script.name,
            status = ?result.status,
            steps = result.step_results.len(),
            duration_ms = result.duration_ms,
            "script finished"
        );
        result
    }
}
