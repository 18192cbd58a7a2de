use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use wheelhouse_core_types::{
    DomStrategy, EscalationChain, EscalationOutcome, ExecutionStats, MethodSpec,
};
use wheelhouse_driver::BrowserDriver;

use crate::context::{interpolate, ExecContext};
use crate::errors::EscalationError;
use crate::vision::{VisionClient, VISION_CALL_COST};

// How long the structural tiers get to observe the page; anything slower
// belongs to a later rung.
const DOM_PROBE_TIMEOUT: Duration = Duration::from_millis(50);
const LOCATOR_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Where a successful rung says the target element is.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedTarget {
    Selector(String),
    Text(String),
    Coordinates { x: f64, y: f64 },
}

impl ResolvedTarget {
    /// Compiled selector string for driver calls, when one can be derived.
    pub fn as_driver_selector(&self) -> Option<String> {
        match self {
            ResolvedTarget::Selector(s) => Some(s.clone()),
            ResolvedTarget::Text(t) => Some(format!("text={t}")),
            ResolvedTarget::Coordinates { .. } => None,
        }
    }
}

/// Result of the first rung that cleared its threshold.
#[derive(Clone, Debug)]
pub struct EscalationSuccess {
    pub data: Value,
    pub confidence: f64,
    pub target: Option<ResolvedTarget>,
    pub outcome: EscalationOutcome,
}

struct TierOutcome {
    success: bool,
    confidence: f64,
    data: Value,
    target: Option<ResolvedTarget>,
}

impl TierOutcome {
    fn miss() -> Self {
        Self {
            success: false,
            confidence: 0.0,
            data: Value::Null,
            target: None,
        }
    }

    fn hit(confidence: f64, data: Value, target: Option<ResolvedTarget>) -> Self {
        Self {
            success: true,
            confidence,
            data,
            target,
        }
    }
}

/// Walks escalation chains against one live page.
pub struct EscalationEngine {
    driver: Arc<dyn BrowserDriver>,
    vision: Option<Arc<dyn VisionClient>>,
    stats: Mutex<ExecutionStats>,
    /// Per-run cap on paid vision calls; `None` means unbounded.
    vision_budget: Option<u64>,
}

impl EscalationEngine {
    pub fn new(driver: Arc<dyn BrowserDriver>, vision: Option<Arc<dyn VisionClient>>) -> Self {
        Self {
            driver,
            vision,
            stats: Mutex::new(ExecutionStats::default()),
            vision_budget: None,
        }
    }

    pub fn with_vision_budget(mut self, budget: u64) -> Self {
        self.vision_budget = Some(budget);
        self
    }

    pub fn stats(&self) -> ExecutionStats {
        self.stats.lock().clone()
    }

    /// Execute the chain, cheapest rung first, stopping at the first result
    /// that clears its confidence threshold. Tier exceptions count as tier
    /// failures, never as chain failures.
    pub async fn run_chain(
        &self,
        chain: &EscalationChain,
        context: &ExecContext,
    ) -> Result<EscalationSuccess, EscalationError> {
        self.stats.lock().total_escalations += 1;

        for (level, rung) in chain.iter().enumerate() {
            debug!(
                target: "escalation",
                level,
                method = rung.spec.name(),
                "trying escalation tier"
            );

            let outcome = match self.execute_tier(&rung.spec, context).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        target: "escalation",
                        level,
                        method = rung.spec.name(),
                        error = %err,
                        "tier raised, counting as failure"
                    );
                    continue;
                }
            };

            if outcome.success && outcome.confidence >= rung.confidence_threshold {
                let cumulative_cost = {
                    let mut stats = self.stats.lock();
                    stats.record_success(level);
                    stats.total_cost
                };
                info!(
                    target: "escalation",
                    level,
                    method = rung.spec.name(),
                    confidence = outcome.confidence,
                    "escalation resolved"
                );
                return Ok(EscalationSuccess {
                    data: outcome.data,
                    confidence: outcome.confidence,
                    target: outcome.target,
                    outcome: EscalationOutcome {
                        level,
                        method: rung.spec.name().to_string(),
                        confidence: outcome.confidence,
                        cost_estimate: tier_cost(&rung.spec),
                        cumulative_cost,
                    },
                });
            }

            debug!(
                target: "escalation",
                level,
                method = rung.spec.name(),
                confidence = outcome.confidence,
                threshold = rung.confidence_threshold,
                "tier below threshold"
            );
        }

        Err(EscalationError::Exhausted {
            attempts: chain.len(),
        })
    }

    async fn execute_tier(
        &self,
        spec: &MethodSpec,
        context: &ExecContext,
    ) -> Result<TierOutcome, EscalationError> {
        match spec {
            MethodSpec::DomCheck { strategy } => self.dom_check(strategy, context).await,
            MethodSpec::Locator { locator } => {
                let selector = locator.to_driver_selector();
                match self
                    .driver
                    .wait_for_selector(&selector, LOCATOR_PROBE_TIMEOUT)
                    .await
                {
                    Ok(()) => Ok(TierOutcome::hit(
                        0.95,
                        json!({ "count": 1, "selector": selector }),
                        Some(ResolvedTarget::Selector(selector)),
                    )),
                    Err(_) => Ok(TierOutcome::miss()),
                }
            }
            MethodSpec::VisionDecide { prompt, schema } => {
                self.vision_decide(prompt, schema.is_some(), context).await
            }
            MethodSpec::VisionLocate {
                prompt,
                prefer,
                fallback,
            } => self.vision_locate(prompt, prefer, fallback, context).await,
        }
    }

    async fn dom_check(
        &self,
        strategy: &DomStrategy,
        context: &ExecContext,
    ) -> Result<TierOutcome, EscalationError> {
        match strategy {
            DomStrategy::CheckPageTitle { matchers } => {
                let title = self.driver.page_info().await?.title.to_lowercase();
                for (key, patterns) in matchers {
                    if patterns.iter().any(|p| title.contains(&p.to_lowercase())) {
                        return Ok(TierOutcome::hit(
                            0.9,
                            json!({ "matched_key": key, "matched_value": title }),
                            None,
                        ));
                    }
                }
                Ok(TierOutcome::miss())
            }
            DomStrategy::CheckUrlPath { matchers } => {
                let url = self.driver.current_url().await?.to_lowercase();
                for (key, patterns) in matchers {
                    if patterns.iter().any(|p| url.contains(&p.to_lowercase())) {
                        return Ok(TierOutcome::hit(
                            0.85,
                            json!({ "matched_key": key, "matched_value": url }),
                            None,
                        ));
                    }
                }
                Ok(TierOutcome::miss())
            }
            DomStrategy::CheckKeyElements { checks } => {
                for check in checks {
                    if self
                        .driver
                        .wait_for_selector(&check.selector, DOM_PROBE_TIMEOUT)
                        .await
                        .is_ok()
                    {
                        return Ok(TierOutcome::hit(
                            0.8,
                            json!({
                                "matched_key": check.indicates,
                                "selector": check.selector,
                            }),
                            Some(ResolvedTarget::Selector(check.selector.clone())),
                        ));
                    }
                }
                Ok(TierOutcome::miss())
            }
            DomStrategy::ExecuteScript { script } => {
                let script = interpolate(script, context);
                let result = self.driver.evaluate(&script).await?;
                Ok(TierOutcome::hit(1.0, json!({ "result": result }), None))
            }
        }
    }

    async fn vision_decide(
        &self,
        prompt: &str,
        want_json: bool,
        context: &ExecContext,
    ) -> Result<TierOutcome, EscalationError> {
        let vision = self.checked_vision()?;
        let prompt = interpolate(prompt, context);
        let screenshot = self.driver.screenshot(None).await?;
        self.charge_vision_call();

        let decision = vision.decide(&screenshot, &prompt, want_json).await?;
        Ok(TierOutcome::hit(decision.confidence, decision.data, None))
    }

    async fn vision_locate(
        &self,
        prompt: &str,
        prefer: &str,
        fallback: &str,
        context: &ExecContext,
    ) -> Result<TierOutcome, EscalationError> {
        let vision = self.checked_vision()?;
        let prompt = interpolate(prompt, context);
        let screenshot = self.driver.screenshot(None).await?;
        self.charge_vision_call();

        let location = vision.locate(&screenshot, &prompt, prefer, fallback).await?;
        let target = match location.method.as_str() {
            "selector" => location
                .value
                .as_str()
                .map(|s| ResolvedTarget::Selector(s.to_string())),
            "text" => location
                .value
                .as_str()
                .map(|t| ResolvedTarget::Text(t.to_string())),
            "coordinates" => {
                let x = location.value.get("x").and_then(Value::as_f64);
                let y = location.value.get("y").and_then(Value::as_f64);
                match (x, y) {
                    (Some(x), Some(y)) => Some(ResolvedTarget::Coordinates { x, y }),
                    _ => None,
                }
            }
            _ => None,
        };
        let success = location.confidence > 0.7 && target.is_some();
        let data = json!({
            "method": location.method,
            "value": location.value,
            "reasoning": location.reasoning,
        });
        Ok(TierOutcome {
            success,
            confidence: location.confidence,
            data,
            target,
        })
    }

    fn checked_vision(&self) -> Result<Arc<dyn VisionClient>, EscalationError> {
        let vision = self
            .vision
            .as_ref()
            .ok_or(EscalationError::VisionUnavailable)?;
        if let Some(budget) = self.vision_budget {
            if self.stats.lock().total_vision_calls >= budget {
                return Err(EscalationError::VisionBudgetExceeded { budget });
            }
        }
        Ok(Arc::clone(vision))
    }

    fn charge_vision_call(&self) {
        let mut stats = self.stats.lock();
        stats.total_vision_calls += 1;
        stats.total_cost += VISION_CALL_COST;
    }
}

fn tier_cost(spec: &MethodSpec) -> f64 {
    if spec.is_vision() {
        VISION_CALL_COST
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wheelhouse_core_types::{ElementCheck, EscalationMethod, LocatorSpec};
    use wheelhouse_driver::StubDriver;

    use crate::vision::{MockVisionClient, VisionLocation};

    fn chain(specs: Vec<MethodSpec>) -> EscalationChain {
        specs.into_iter().map(EscalationMethod::new).collect()
    }

    fn engine_with(
        driver: StubDriver,
        vision: Option<Arc<MockVisionClient>>,
    ) -> EscalationEngine {
        let vision = vision.map(|v| v as Arc<dyn VisionClient>);
        EscalationEngine::new(Arc::new(driver), vision)
    }

    #[tokio::test]
    async fn locator_tier_short_circuits_before_vision() {
        let driver = StubDriver::new().with_element("#submit");
        let vision = Arc::new(MockVisionClient::new());
        let engine = engine_with(driver, Some(vision.clone()));

        let chain = chain(vec![
            MethodSpec::Locator {
                locator: LocatorSpec::selector("#submit"),
            },
            MethodSpec::VisionLocate {
                prompt: "the submit button".into(),
                prefer: "selector".into(),
                fallback: "coordinates".into(),
            },
        ]);

        let success = engine.run_chain(&chain, &ExecContext::new()).await.unwrap();
        assert_eq!(success.outcome.level, 0);
        assert_eq!(success.outcome.cost_estimate, 0.0);
        assert_eq!(
            success.target,
            Some(ResolvedTarget::Selector("#submit".into()))
        );
        let stats = engine.stats();
        assert_eq!(stats.total_vision_calls, 0);
        assert_eq!(stats.total_cost, 0.0);
        assert_eq!(vision.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_tiers_escalate_to_vision() {
        let driver = StubDriver::new();
        let vision = Arc::new(MockVisionClient::new());
        vision.push_location(VisionLocation {
            method: "selector".into(),
            value: serde_json::json!("#found-by-vision"),
            confidence: 0.92,
            reasoning: "clearly the button".into(),
        });
        let engine = engine_with(driver, Some(vision.clone()));

        let chain = chain(vec![
            MethodSpec::Locator {
                locator: LocatorSpec::selector("#absent"),
            },
            MethodSpec::VisionLocate {
                prompt: "the checkout button".into(),
                prefer: "selector".into(),
                fallback: "coordinates".into(),
            },
        ]);

        let success = engine.run_chain(&chain, &ExecContext::new()).await.unwrap();
        assert_eq!(success.outcome.level, 1);
        assert_eq!(success.outcome.method, "vision_locate");
        assert!((success.outcome.cumulative_cost - VISION_CALL_COST).abs() < 1e-9);
        assert_eq!(engine.stats().total_vision_calls, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_is_an_error() {
        let driver = StubDriver::new();
        let engine = engine_with(driver, None);
        let chain = chain(vec![MethodSpec::Locator {
            locator: LocatorSpec::selector("#nope"),
        }]);
        let err = engine
            .run_chain(&chain, &ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Exhausted { attempts: 1 }));
    }

    #[tokio::test]
    async fn title_matcher_reports_matched_key() {
        let driver = StubDriver::new().with_title("Dashboard - Acme Corp");
        let engine = engine_with(driver, None);
        let mut matchers = BTreeMap::new();
        matchers.insert("logged_in".to_string(), vec!["dashboard".to_string()]);
        let chain = chain(vec![MethodSpec::DomCheck {
            strategy: DomStrategy::CheckPageTitle { matchers },
        }]);

        let success = engine.run_chain(&chain, &ExecContext::new()).await.unwrap();
        assert_eq!(success.data["matched_key"], "logged_in");
        assert!((success.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn key_element_check_resolves_a_target() {
        let driver = StubDriver::new().with_element(".avatar");
        let engine = engine_with(driver, None);
        let chain = chain(vec![MethodSpec::DomCheck {
            strategy: DomStrategy::CheckKeyElements {
                checks: vec![
                    ElementCheck {
                        selector: ".missing".into(),
                        indicates: "nothing".into(),
                    },
                    ElementCheck {
                        selector: ".avatar".into(),
                        indicates: "logged_in".into(),
                    },
                ],
            },
        }]);

        let success = engine.run_chain(&chain, &ExecContext::new()).await.unwrap();
        assert_eq!(success.data["matched_key"], "logged_in");
        assert_eq!(
            success.target,
            Some(ResolvedTarget::Selector(".avatar".into()))
        );
    }

    #[tokio::test]
    async fn vision_budget_blocks_paid_tiers() {
        let driver = StubDriver::new();
        let vision = Arc::new(MockVisionClient::new());
        vision.push_location(VisionLocation {
            method: "selector".into(),
            value: serde_json::json!("#x"),
            confidence: 0.9,
            reasoning: String::new(),
        });
        let engine = engine_with(driver, Some(vision.clone())).with_vision_budget(0);

        let chain = chain(vec![MethodSpec::VisionLocate {
            prompt: "anything".into(),
            prefer: "selector".into(),
            fallback: "coordinates".into(),
        }]);

        // Budget exhaustion makes the tier fail, so the chain exhausts.
        let err = engine
            .run_chain(&chain, &ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Exhausted { .. }));
        assert_eq!(vision.call_count(), 0);
    }

    #[tokio::test]
    async fn low_confidence_vision_does_not_clear_threshold() {
        let driver = StubDriver::new();
        let vision = Arc::new(MockVisionClient::new());
        vision.push_location(VisionLocation {
            method: "selector".into(),
            value: serde_json::json!("#maybe"),
            confidence: 0.4,
            reasoning: "hard to tell".into(),
        });
        let engine = engine_with(driver, Some(vision));

        let chain = chain(vec![MethodSpec::VisionLocate {
            prompt: "the thing".into(),
            prefer: "selector".into(),
            fallback: "coordinates".into(),
        }]);

        let err = engine
            .run_chain(&chain, &ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn execute_script_interpolates_context() {
        let driver = StubDriver::new()
            .with_eval_result("document.title.includes('Ada')", serde_json::json!(true));
        let engine = engine_with(driver, None);
        let mut context = ExecContext::new();
        context.insert("name".into(), serde_json::json!("Ada"));
        let chain = chain(vec![MethodSpec::DomCheck {
            strategy: DomStrategy::ExecuteScript {
                script: "document.title.includes('{{name}}')".into(),
            },
        }]);

        let success = engine.run_chain(&chain, &context).await.unwrap();
        assert_eq!(success.data["result"], serde_json::json!(true));
        assert!((success.confidence - 1.0).abs() < 1e-9);
    }
}
