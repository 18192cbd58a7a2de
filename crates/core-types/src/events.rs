//! Event vocabulary emitted by the script runner.
//!
//! The control plane wraps these in a per-session envelope (session id plus a
//! monotonic sequence number) before fanning them out to observers; observers
//! never mutate anything through them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::{ArtifactRef, ErrorInfo, ScriptResult, StepResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    ScriptStarted {
        script_name: String,
    },
    StepStart {
        step_index: i64,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StepComplete {
        step_index: i64,
        result: StepResult,
        timestamp: DateTime<Utc>,
    },
    /// Inline screenshot payload for live observers; the artifact reference
    /// carries the durable identity.
    Screenshot {
        artifact: ArtifactRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    ScriptComplete {
        result: ScriptResult,
    },
    ScriptPaused,
    ScriptResumed,
    ScriptStopped,
    ScriptError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_index: Option<i64>,
        error: ErrorInfo,
    },
}

impl RunnerEvent {
    pub fn step_start(step_index: i64, action: impl Into<String>, description: Option<String>) -> Self {
        RunnerEvent::StepStart {
            step_index,
            action: action.into(),
            description,
            timestamp: Utc::now(),
        }
    }

    pub fn step_complete(step_index: i64, result: StepResult) -> Self {
        RunnerEvent::StepComplete {
            step_index,
            result,
            timestamp: Utc::now(),
        }
    }

    /// Event-type tag as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunnerEvent::ScriptStarted { .. } => "script_started",
            RunnerEvent::StepStart { .. } => "step_start",
            RunnerEvent::StepComplete { .. } => "step_complete",
            RunnerEvent::Screenshot { .. } => "screenshot",
            RunnerEvent::ScriptComplete { .. } => "script_complete",
            RunnerEvent::ScriptPaused => "script_paused",
            RunnerEvent::ScriptResumed => "script_resumed",
            RunnerEvent::ScriptStopped => "script_stopped",
            RunnerEvent::ScriptError { .. } => "script_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tags() {
        let event = RunnerEvent::step_start(2, "click", Some("press the button".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_start");
        assert_eq!(json["step_index"], 2);
        assert_eq!(json["type"], event.type_name());
    }
}
