use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::locator::LocatorSpec;

/// Page-load condition a navigation waits for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum WaitUntil {
    #[default]
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

/// Profile requirements a script declares for its session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub clone_for_parallel: bool,
    /// `None` means the caller did not state a preference; resolution treats
    /// that as `true`. Kept optional so the default is visible to callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_temp_profile: Option<bool>,
    #[serde(default)]
    pub requires_human_login: bool,
    #[serde(default)]
    pub wait_for_human_login: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_login_verification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_channel: Option<String>,
}

impl SessionRequirements {
    pub fn named(profile: impl Into<String>) -> Self {
        Self {
            profile_name: Some(profile.into()),
            ..Default::default()
        }
    }

    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn allows_temp_profile(&self) -> bool {
        self.allow_temp_profile.unwrap_or(true)
    }
}

/// Which checks a `validate_profile` step runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Static,
    Runtime,
    Both,
}

/// One DOM-tier probe of the escalation ladder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DomStrategy {
    /// Match substrings against the lowercased page title.
    CheckPageTitle {
        matchers: BTreeMap<String, Vec<String>>,
    },
    /// Match substrings against the lowercased current URL.
    CheckUrlPath {
        matchers: BTreeMap<String, Vec<String>>,
    },
    /// Probe a list of selectors; the first hit wins.
    CheckKeyElements { checks: Vec<ElementCheck> },
    /// Evaluate an arbitrary expression in the page.
    ExecuteScript { script: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementCheck {
    pub selector: String,
    /// Label reported back when the selector is present.
    pub indicates: String,
}

/// One rung of an escalation chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MethodSpec {
    DomCheck {
        #[serde(flatten)]
        strategy: DomStrategy,
    },
    Locator {
        locator: LocatorSpec,
    },
    VisionDecide {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    VisionLocate {
        prompt: String,
        #[serde(default = "default_prefer")]
        prefer: String,
        #[serde(default = "default_fallback")]
        fallback: String,
    },
}

fn default_prefer() -> String {
    "selector".to_string()
}

fn default_fallback() -> String {
    "coordinates".to_string()
}

impl MethodSpec {
    /// Stable name used in logs and escalation attempt records.
    pub fn name(&self) -> &'static str {
        match self {
            MethodSpec::DomCheck { .. } => "dom_check",
            MethodSpec::Locator { .. } => "locator",
            MethodSpec::VisionDecide { .. } => "vision_decide",
            MethodSpec::VisionLocate { .. } => "vision_locate",
        }
    }

    /// Whether the rung spends money (vision tiers do, structural ones do not).
    pub fn is_vision(&self) -> bool {
        matches!(
            self,
            MethodSpec::VisionDecide { .. } | MethodSpec::VisionLocate { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationMethod {
    #[serde(flatten)]
    pub spec: MethodSpec,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl EscalationMethod {
    pub fn new(spec: MethodSpec) -> Self {
        Self {
            spec,
            confidence_threshold: default_confidence_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }
}

/// Ordered cheapest-first ladder of methods for one abstract action.
pub type EscalationChain = Vec<EscalationMethod>;

/// One declarative unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub screenshot_after: bool,
    /// Credential tag; the control plane merges the matching sub-object of
    /// the consolidated secret into the step input before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            description: None,
            screenshot_after: false,
            tool_name: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_screenshot_after(mut self) -> Self {
        self.screenshot_after = true;
        self
    }

    /// Short action name used in events and results.
    pub fn action(&self) -> &'static str {
        self.kind.action()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepKind {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: WaitUntil,
        /// Seconds; the executor falls back to the session default, then the
        /// process-wide default of 60.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    Click {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<LocatorSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation: Option<EscalationChain>,
    },
    Fill {
        locator: LocatorSpec,
        value: String,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<LocatorSpec>,
        /// Milliseconds to wait for the locator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        /// Fixed delay in milliseconds when no locator is given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
    },
    Press {
        key: String,
    },
    Hover {
        locator: LocatorSpec,
    },
    Select {
        locator: LocatorSpec,
        value: String,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<LocatorSpec>,
        #[serde(default)]
        delta_y: i64,
    },
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<LocatorSpec>,
    },
    Evaluate {
        script: String,
    },
    Extract {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locator: Option<LocatorSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation: Option<EscalationChain>,
        /// Attribute to read; text content when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },
    ActWithSchema {
        prompt: String,
        schema: Value,
    },
    ValidateProfile {
        #[serde(default)]
        mode: ValidationMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ui_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cookie_domains: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cookie_names: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        local_storage_keys: Vec<String>,
    },
}

impl StepKind {
    pub fn action(&self) -> &'static str {
        match self {
            StepKind::Navigate { .. } => "navigate",
            StepKind::Click { .. } => "click",
            StepKind::Fill { .. } => "fill",
            StepKind::Wait { .. } => "wait",
            StepKind::Press { .. } => "press",
            StepKind::Hover { .. } => "hover",
            StepKind::Select { .. } => "select",
            StepKind::Scroll { .. } => "scroll",
            StepKind::Screenshot { .. } => "screenshot",
            StepKind::Evaluate { .. } => "evaluate",
            StepKind::Extract { .. } => "extract",
            StepKind::ActWithSchema { .. } => "act_with_schema",
            StepKind::ValidateProfile { .. } => "validate_profile",
        }
    }
}

/// Declarative workflow; immutable once submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_page: Option<String>,
    #[serde(default)]
    pub abort_on_error: bool,
    #[serde(default)]
    pub session: SessionRequirements,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            starting_page: None,
            abort_on_error: false,
            session: SessionRequirements::default(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_json_uses_the_action_tag() {
        let raw = serde_json::json!({
            "action": "fill",
            "locator": {"strategy": "selector", "value": "#email"},
            "value": "a@b.c",
            "description": "enter email"
        });
        let step: Step = serde_json::from_value(raw).unwrap();
        assert_eq!(step.action(), "fill");
        assert!(!step.screenshot_after);
    }

    #[test]
    fn escalation_method_defaults_threshold() {
        let raw = serde_json::json!({
            "method": "locator",
            "locator": {"strategy": "selector", "value": "#submit"}
        });
        let method: EscalationMethod = serde_json::from_value(raw).unwrap();
        assert_eq!(method.confidence_threshold, 0.7);
        assert_eq!(method.spec.name(), "locator");
        assert!(!method.spec.is_vision());
    }

    #[test]
    fn dom_strategy_round_trip() {
        let raw = serde_json::json!({
            "method": "dom_check",
            "strategy": "check_key_elements",
            "checks": [{"selector": ".avatar", "indicates": "logged_in"}],
            "confidence_threshold": 0.8
        });
        let method: EscalationMethod = serde_json::from_value(raw.clone()).unwrap();
        match &method.spec {
            MethodSpec::DomCheck {
                strategy: DomStrategy::CheckKeyElements { checks },
            } => assert_eq!(checks[0].indicates, "logged_in"),
            other => panic!("unexpected spec: {other:?}"),
        }
        let back = serde_json::to_value(&method).unwrap();
        assert_eq!(back["method"], "dom_check");
        assert_eq!(back["strategy"], "check_key_elements");
    }

    #[test]
    fn script_defaults_are_permissive() {
        let raw = serde_json::json!({
            "name": "demo",
            "steps": [{"action": "navigate", "url": "https://example.com"}]
        });
        let script: Script = serde_json::from_value(raw).unwrap();
        assert!(!script.abort_on_error);
        assert!(script.session.allows_temp_profile());
        assert_eq!(script.steps.len(), 1);
    }
}
