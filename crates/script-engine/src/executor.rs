use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};
use wheelhouse_artifact_store::{Artifact, ArtifactUploader};
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::{
    ArtifactRef, ErrorInfo, EscalationChain, EscalationMethod, LocatorSpec, MethodSpec, SessionId,
    Step, StepKind, StepResult, ValidationMode,
};
use wheelhouse_driver::{BrowserDriver, DriverError};
use wheelhouse_escalation::{EscalationEngine, ExecContext, ResolvedTarget};
use wheelhouse_profile_store::{validate_user_data_dir, RuntimeValidation, ValidationReport};

use crate::credentials::CredentialProvider;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WAIT_DELAY_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub default_step_timeout: Duration,
    /// Profile the session resolved to, `None` for temporary sessions.
    pub profile_name: Option<String>,
    /// Live user-data directory backing the session, for validation steps.
    pub user_data_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(60),
            profile_name: None,
            user_data_dir: None,
        }
    }
}

/// Executes one typed step against a bound session.
///
/// Never returns `Err`: failures are encoded in the [`StepResult`] so the
/// runner can apply the abort policy uniformly.
pub struct StepExecutor {
    driver: Arc<dyn BrowserDriver>,
    engine: Arc<EscalationEngine>,
    uploader: Arc<ArtifactUploader>,
    session_id: SessionId,
    events: broadcast::Sender<RunnerEvent>,
    config: ExecutorConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl StepExecutor {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        engine: Arc<EscalationEngine>,
        uploader: Arc<ArtifactUploader>,
        session_id: SessionId,
        events: broadcast::Sender<RunnerEvent>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            driver,
            engine,
            uploader,
            session_id,
            events,
            config,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        Arc::clone(&self.driver)
    }

    pub fn engine(&self) -> Arc<EscalationEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn execute(&self, index: i64, step: &Step, context: &ExecContext) -> StepResult {
        debug!(
            target: "script-engine",
            index,
            action = step.action(),
            "executing step"
        );
        // Merge per-tool credentials into the context for tagged steps.
        // A missing entry is logged and the step proceeds without.
        let enriched;
        let context = match (&step.tool_name, &self.credentials) {
            (Some(tool), Some(provider)) => {
                let mut merged = context.clone();
                match provider.credentials_for(tool) {
                    Some(credentials) => {
                        merged.insert("credentials".to_string(), credentials);
                    }
                    None => {
                        debug!(target: "script-engine", tool, "no credentials configured");
                    }
                }
                enriched = merged;
                &enriched
            }
            _ => context,
        };
        let mut result = self.execute_kind(index, step, context).await;

        if step.screenshot_after && result.is_success() {
            match self.capture_screenshot(index, None).await {
                Ok(artifact) => result = result.with_artifact(artifact),
                Err(err) => {
                    warn!(target: "script-engine", index, error = %err, "screenshot_after failed");
                }
            }
        }
        result
    }

    async fn execute_kind(&self, index: i64, step: &Step, context: &ExecContext) -> StepResult {
        let result = StepResult::started(index, step.action());
        let timeout = self.config.default_step_timeout;

        match &step.kind {
            StepKind::Navigate {
                url,
                wait_until,
                timeout: step_timeout,
            } => {
                let effective = step_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(timeout);
                match self.driver.goto(url, *wait_until, effective).await {
                    Ok(()) => result.succeed(json!({ "url": url })),
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Click { locator, escalation } => {
                self.click_step(result, locator.as_ref(), escalation.as_ref(), context, timeout)
                    .await
            }

            StepKind::Fill { locator, value } => {
                let selector = locator.to_driver_selector();
                match self.driver.fill(&selector, value, timeout).await {
                    Ok(()) => result.succeed(json!({ "selector": selector })),
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Wait {
                locator,
                timeout: wait_timeout,
                delay,
            } => match locator {
                Some(locator) => {
                    let selector = locator.to_driver_selector();
                    let wait = Duration::from_millis(wait_timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
                    let outcome = self
                        .retry_idempotent(|| self.driver.wait_for_selector(&selector, wait))
                        .await;
                    match outcome {
                        Ok(()) => result.succeed(json!({ "selector": selector })),
                        Err(err) => result.fail(driver_error(&err)),
                    }
                }
                None => {
                    let delay = Duration::from_millis(delay.unwrap_or(DEFAULT_WAIT_DELAY_MS));
                    sleep(delay).await;
                    result.succeed(json!({ "waited_ms": delay.as_millis() as u64 }))
                }
            },

            StepKind::Press { key } => match self.driver.press_key(key).await {
                Ok(()) => result.succeed(json!({ "key": key })),
                Err(err) => result.fail(driver_error(&err)),
            },

            StepKind::Hover { locator } => {
                let selector = locator.to_driver_selector();
                match self.driver.hover(&selector, timeout).await {
                    Ok(()) => result.succeed(json!({ "selector": selector })),
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Select { locator, value } => {
                let selector = locator.to_driver_selector();
                match self.driver.select_option(&selector, value, timeout).await {
                    Ok(()) => result.succeed(json!({ "selector": selector, "value": value })),
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Scroll { locator, delta_y } => {
                let selector = locator.as_ref().map(LocatorSpec::to_driver_selector);
                match self.driver.scroll(selector.as_deref(), *delta_y).await {
                    Ok(()) => result.succeed(json!({ "delta_y": delta_y })),
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Screenshot { locator } => {
                let selector = locator.as_ref().map(LocatorSpec::to_driver_selector);
                match self.capture_screenshot(index, selector.as_deref()).await {
                    Ok(artifact) => {
                        let id = artifact.id.clone();
                        result
                            .succeed(json!({ "artifact_id": id }))
                            .with_artifact(artifact)
                    }
                    Err(err) => result.fail(driver_error(&err)),
                }
            }

            StepKind::Evaluate { script } => match self.driver.evaluate(script).await {
                Ok(value) => result.succeed(json!({ "result": value })),
                Err(err) => result.fail(driver_error(&err)),
            },

            StepKind::Extract {
                locator,
                escalation,
                attribute,
            } => {
                self.extract_step(
                    result,
                    locator.as_ref(),
                    escalation.as_ref(),
                    attribute.as_deref(),
                    context,
                )
                .await
            }

            StepKind::ActWithSchema { prompt, schema } => {
                self.act_with_schema(result, prompt, schema, context).await
            }

            StepKind::ValidateProfile {
                mode,
                ui_prompt,
                cookie_domains,
                cookie_names,
                local_storage_keys,
            } => {
                self.validate_profile(
                    result,
                    *mode,
                    ui_prompt.as_deref(),
                    cookie_domains,
                    cookie_names,
                    local_storage_keys,
                    context,
                )
                .await
            }
        }
    }

    async fn click_step(
        &self,
        result: StepResult,
        locator: Option<&LocatorSpec>,
        escalation: Option<&EscalationChain>,
        context: &ExecContext,
        timeout: Duration,
    ) -> StepResult {
        if let Some(chain) = escalation {
            let success = match self.engine.run_chain(chain, context).await {
                Ok(success) => success,
                Err(err) => {
                    return result.fail(ErrorInfo::new(err.kind(), err.to_string()));
                }
            };
            let outcome = success.outcome.clone();
            let click = match success.target {
                Some(ResolvedTarget::Coordinates { x, y }) => self.driver.click_at(x, y).await,
                Some(target) => match target.as_driver_selector() {
                    Some(selector) => self.driver.click(&selector, timeout).await,
                    None => Err(DriverError::element_not_found("click", "<escalated target>")),
                },
                None => {
                    return result
                        .fail(ErrorInfo::new(
                            "escalation_no_target",
                            "escalation succeeded but produced no clickable target",
                        ))
                        .with_escalation(outcome);
                }
            };
            return match click {
                Ok(()) => result
                    .succeed(success.data)
                    .with_escalation(outcome),
                Err(err) => result.fail(driver_error(&err)).with_escalation(outcome),
            };
        }

        let Some(locator) = locator else {
            return result.fail(ErrorInfo::new(
                "invalid_step",
                "click step needs a locator or an escalation chain",
            ));
        };
        let selector = locator.to_driver_selector();
        match self.driver.click(&selector, timeout).await {
            Ok(()) => result.succeed(json!({ "selector": selector })),
            Err(err) => result.fail(driver_error(&err)),
        }
    }

    async fn extract_step(
        &self,
        result: StepResult,
        locator: Option<&LocatorSpec>,
        escalation: Option<&EscalationChain>,
        attribute: Option<&str>,
        context: &ExecContext,
    ) -> StepResult {
        if let Some(chain) = escalation {
            return match self.engine.run_chain(chain, context).await {
                Ok(success) => {
                    let outcome = success.outcome.clone();
                    result
                        .succeed(json!({ "data": success.data }))
                        .with_escalation(outcome)
                }
                Err(err) => result.fail(ErrorInfo::new(err.kind(), err.to_string())),
            };
        }

        let Some(locator) = locator else {
            return result.fail(ErrorInfo::new(
                "invalid_step",
                "extract step needs a locator or an escalation chain",
            ));
        };
        let selector = locator.to_driver_selector();
        match self.driver.element_text(&selector, attribute).await {
            Ok(text) => result.succeed(json!({ "data": { "text": text } })),
            Err(err) => result.fail(driver_error(&err)),
        }
    }

    async fn act_with_schema(
        &self,
        result: StepResult,
        prompt: &str,
        schema: &Value,
        context: &ExecContext,
    ) -> StepResult {
        let chain: EscalationChain = vec![EscalationMethod::new(MethodSpec::VisionDecide {
            prompt: prompt.to_string(),
            schema: Some(schema.clone()),
        })];
        let success = match self.engine.run_chain(&chain, context).await {
            Ok(success) => success,
            Err(err) => return result.fail(ErrorInfo::new(err.kind(), err.to_string())),
        };

        let validator = match jsonschema::validator_for(schema) {
            Ok(validator) => validator,
            Err(err) => {
                return result.fail(ErrorInfo::new(
                    "schema_validation",
                    format!("caller schema is not a valid JSON schema: {err}"),
                ));
            }
        };
        let outcome = success.outcome.clone();
        if let Err(error) = validator.validate(&success.data) {
            // Never coerced; a mismatching response is a step error.
            return result
                .fail(ErrorInfo::new(
                    "schema_validation",
                    format!("response does not match schema: {error}"),
                ))
                .with_escalation(outcome);
        }
        result
            .succeed(json!({
                "parsed_response": success.data,
                "matches_schema": true,
            }))
            .with_escalation(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_profile(
        &self,
        result: StepResult,
        mode: ValidationMode,
        ui_prompt: Option<&str>,
        cookie_domains: &[String],
        cookie_names: &[String],
        local_storage_keys: &[String],
        context: &ExecContext,
    ) -> StepResult {
        let static_checks = match &self.config.user_data_dir {
            Some(dir) => validate_user_data_dir(dir),
            None => validate_user_data_dir(std::path::Path::new("")),
        };
        let profile_label = self
            .config
            .profile_name
            .clone()
            .unwrap_or_else(|| "temporary".to_string());
        let mut report = ValidationReport::new(profile_label, static_checks);

        if matches!(mode, ValidationMode::Runtime | ValidationMode::Both) {
            let mut runtime = RuntimeValidation::default();

            if let Some(prompt) = ui_prompt {
                let chain: EscalationChain =
                    vec![EscalationMethod::new(MethodSpec::VisionDecide {
                        prompt: prompt.to_string(),
                        schema: Some(json!({ "type": "object" })),
                    })];
                runtime.ui_ok = match self.engine.run_chain(&chain, context).await {
                    Ok(success) => Some(bool_verdict(&success.data).unwrap_or(false)),
                    Err(err) => {
                        warn!(target: "script-engine", error = %err, "ui probe failed");
                        Some(false)
                    }
                };
            }

            if !cookie_domains.is_empty() && !cookie_names.is_empty() {
                runtime.cookies_ok = match self.driver.cookies(cookie_domains).await {
                    Ok(cookies) => {
                        let mut found: Vec<String> =
                            cookies.iter().map(|c| c.name.clone()).collect();
                        found.sort();
                        found.dedup();
                        let all = cookie_names.iter().all(|name| found.contains(name));
                        runtime.cookies_found = found;
                        Some(all)
                    }
                    Err(err) => {
                        warn!(target: "script-engine", error = %err, "cookie check failed");
                        Some(false)
                    }
                };
            }

            if !local_storage_keys.is_empty() {
                let mut all_present = true;
                for key in local_storage_keys {
                    match self.driver.local_storage_get(key).await {
                        Ok(Some(_)) => {}
                        Ok(None) => all_present = false,
                        Err(err) => {
                            warn!(target: "script-engine", error = %err, "local storage check failed");
                            all_present = false;
                        }
                    }
                }
                runtime.local_storage_ok = Some(all_present);
            }

            report = report.with_runtime(runtime);
        }

        let payload = match serde_json::to_value(&report) {
            Ok(value) => value,
            Err(err) => {
                return result.fail(ErrorInfo::new("internal", err.to_string()));
            }
        };
        result.succeed(payload)
    }

    /// Capture a screenshot, register the artifact, and tell observers.
    pub(crate) async fn capture_screenshot(
        &self,
        index: i64,
        selector: Option<&str>,
    ) -> Result<ArtifactRef, DriverError> {
        let bytes = self
            .retry_idempotent(|| self.driver.screenshot(selector))
            .await?;
        let encoded = STANDARD.encode(&bytes);
        let artifact = Artifact::screenshot(self.session_id.clone(), index, bytes);
        let handle = self.uploader.submit(artifact);
        let _ = self.events.send(RunnerEvent::Screenshot {
            artifact: handle.clone(),
            screenshot: Some(encoded),
        });
        Ok(handle)
    }

    /// One retry with a short back-off, reserved for driver operations that
    /// are safe to repeat.
    async fn retry_idempotent<T, F, Fut>(&self, op: F) -> Result<T, DriverError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        match op().await {
            Err(err) if err.retriable => {
                debug!(target: "script-engine", error = %err, "retrying idempotent operation");
                sleep(RETRY_BACKOFF).await;
                op().await
            }
            other => other,
        }
    }
}

fn driver_error(err: &DriverError) -> ErrorInfo {
    ErrorInfo::new(err.kind_str(), err.to_string())
}

fn bool_verdict(value: &Value) -> Option<bool> {
    value
        .as_bool()
        .or_else(|| value.get("answer").and_then(Value::as_bool))
        .or_else(|| value.get("result").and_then(Value::as_bool))
        .or_else(|| value.get("logged_in").and_then(Value::as_bool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wheelhouse_core_types::StepStatus;
    use wheelhouse_driver::StubDriver;
    use wheelhouse_escalation::{MockVisionClient, VisionClient, VisionDecision};

    fn executor_for(driver: StubDriver) -> StepExecutor {
        executor_with_vision(driver, None)
    }

    fn executor_with_vision(
        driver: StubDriver,
        vision: Option<Arc<MockVisionClient>>,
    ) -> StepExecutor {
        let driver: Arc<dyn BrowserDriver> = Arc::new(driver);
        let vision = vision.map(|v| v as Arc<dyn VisionClient>);
        let engine = Arc::new(EscalationEngine::new(Arc::clone(&driver), vision));
        let uploader = Arc::new(ArtifactUploader::disabled());
        let (events, _) = broadcast::channel(64);
        StepExecutor::new(
            driver,
            engine,
            uploader,
            SessionId::new(),
            events,
            ExecutorConfig::default(),
        )
    }

    fn step(kind: StepKind) -> Step {
        Step::new(kind)
    }

    #[tokio::test]
    async fn navigate_success_reports_url() {
        let executor = executor_for(StubDriver::new());
        let result = executor
            .execute(
                0,
                &step(StepKind::Navigate {
                    url: "https://example.com".into(),
                    wait_until: Default::default(),
                    timeout: None,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.output["url"], "https://example.com");
    }

    #[tokio::test]
    async fn click_missing_element_is_element_not_found() {
        let executor = executor_for(StubDriver::new());
        let result = executor
            .execute(
                1,
                &step(StepKind::Click {
                    locator: Some(LocatorSpec::selector("#gone")),
                    escalation: None,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(result.error.unwrap().kind, "element_not_found");
    }

    #[tokio::test]
    async fn wait_step_retries_transient_timeout_once() {
        let driver = StubDriver::new().with_element("#late");
        driver.fail_once(
            "wait_for_selector",
            DriverError::timeout("wait_for_selector"),
        );
        let executor = executor_for(driver);
        let result = executor
            .execute(
                0,
                &step(StepKind::Wait {
                    locator: Some(LocatorSpec::selector("#late")),
                    timeout: Some(100),
                    delay: None,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn screenshot_step_emits_artifact_and_event() {
        let executor = executor_for(StubDriver::new());
        let mut events = executor.events.subscribe();
        let result = executor
            .execute(
                2,
                &step(StepKind::Screenshot { locator: None }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.artifacts.len(), 1);
        match events.recv().await.unwrap() {
            RunnerEvent::Screenshot { screenshot, .. } => {
                assert!(screenshot.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn screenshot_after_attaches_extra_artifact() {
        let driver = StubDriver::new().with_element("#go");
        let executor = executor_for(driver);
        let mut click = step(StepKind::Click {
            locator: Some(LocatorSpec::selector("#go")),
            escalation: None,
        });
        click.screenshot_after = true;
        let result = executor.execute(0, &click, &ExecContext::new()).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn act_with_schema_rejects_mismatching_response() {
        let vision = Arc::new(MockVisionClient::new());
        vision.push_decision(VisionDecision {
            data: json!({ "price": "not-a-number" }),
            confidence: 0.9,
            raw: String::new(),
        });
        let executor = executor_with_vision(StubDriver::new(), Some(vision));
        let schema = json!({
            "type": "object",
            "properties": { "price": { "type": "number" } },
            "required": ["price"],
        });
        let result = executor
            .execute(
                0,
                &step(StepKind::ActWithSchema {
                    prompt: "extract the price".into(),
                    schema,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(result.error.unwrap().kind, "schema_validation");
    }

    #[tokio::test]
    async fn act_with_schema_accepts_valid_response() {
        let vision = Arc::new(MockVisionClient::new());
        vision.push_decision(VisionDecision {
            data: json!({ "price": 12.5, "confidence": 0.93 }),
            confidence: 0.93,
            raw: String::new(),
        });
        let executor = executor_with_vision(StubDriver::new(), Some(vision));
        let schema = json!({
            "type": "object",
            "properties": { "price": { "type": "number" } },
            "required": ["price"],
        });
        let result = executor
            .execute(
                0,
                &step(StepKind::ActWithSchema {
                    prompt: "extract the price".into(),
                    schema,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.output["matches_schema"], true);
        assert_eq!(result.escalation.as_ref().unwrap().method, "vision_decide");
    }

    #[tokio::test]
    async fn extract_reads_element_text() {
        let driver = StubDriver::new().with_text("h1.title", "Monthly bill: £30");
        let executor = executor_for(driver);
        let result = executor
            .execute(
                0,
                &step(StepKind::Extract {
                    locator: Some(LocatorSpec::selector("h1.title")),
                    escalation: None,
                    attribute: None,
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.output["data"]["text"], "Monthly bill: £30");
    }

    #[tokio::test]
    async fn validate_profile_runtime_checks_cookies_and_storage() {
        let driver = StubDriver::new()
            .with_cookie(wheelhouse_driver::Cookie {
                name: "session_token".into(),
                value: "abc".into(),
                domain: ".example.com".into(),
                path: "/".into(),
            })
            .with_local_storage("auth_state", "{}");
        let executor = executor_for(driver);
        let result = executor
            .execute(
                0,
                &step(StepKind::ValidateProfile {
                    mode: ValidationMode::Runtime,
                    ui_prompt: None,
                    cookie_domains: vec!["example.com".into()],
                    cookie_names: vec!["session_token".into()],
                    local_storage_keys: vec!["auth_state".into()],
                }),
                &ExecContext::new(),
            )
            .await;
        assert_eq!(result.status, StepStatus::Success);
        let runtime = &result.output["runtime"];
        assert_eq!(runtime["cookies_ok"], true);
        assert_eq!(runtime["local_storage_ok"], true);
    }
}
