use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ArtifactId, SessionId};

/// Outcome of one step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

/// Stable error kind plus human-readable message, safe to hand to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// How a step's escalation resolved, rolled up into the step result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub level: usize,
    pub method: String,
    pub confidence: f64,
    pub cost_estimate: f64,
    pub cumulative_cost: f64,
}

/// Per-run escalation counters, exposed at run end as result metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_escalations: u64,
    pub tier_successes: [u64; 4],
    pub total_cost: f64,
    pub total_vision_calls: u64,
}

impl ExecutionStats {
    pub fn record_success(&mut self, level: usize) {
        let slot = level.min(3);
        self.tier_successes[slot] += 1;
    }

    pub fn merge(&mut self, other: &ExecutionStats) {
        self.total_escalations += other.total_escalations;
        for (mine, theirs) in self.tier_successes.iter_mut().zip(other.tier_successes) {
            *mine += theirs;
        }
        self.total_cost += other.total_cost;
        self.total_vision_calls += other.total_vision_calls;
    }

    pub fn avg_escalation_level(&self) -> f64 {
        if self.total_escalations == 0 {
            return 0.0;
        }
        let weighted: u64 = self
            .tier_successes
            .iter()
            .enumerate()
            .map(|(level, count)| level as u64 * count)
            .sum();
        weighted as f64 / self.total_escalations as f64
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Recording,
}

impl ArtifactKind {
    /// Object-key path segment for the artifact category.
    pub fn category(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshots",
            ArtifactKind::Recording => "recordings",
        }
    }
}

/// Upload progress for an artifact, observable after the script completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    UploadPending,
    Uploaded { uri: String },
    UploadFailed { reason: String },
    /// Uploads disabled; the artifact only exists in memory / on disk.
    Local,
}

/// Lightweight reference to an artifact attached to a step result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub upload: UploadState,
}

/// Outcome of one step, append-only within the script result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Position in the originating script; -1 for the starting-page pseudo-step.
    pub step_index: i64,
    pub action: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationOutcome>,
}

impl StepResult {
    pub fn started(step_index: i64, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_index,
            action: action.into(),
            status: StepStatus::Error,
            started_at: now,
            finished_at: now,
            output: Value::Null,
            artifacts: Vec::new(),
            error: None,
            escalation: None,
        }
    }

    pub fn succeed(mut self, output: Value) -> Self {
        self.status = StepStatus::Success;
        self.output = output;
        self.finished_at = Utc::now();
        self
    }

    pub fn fail(mut self, error: ErrorInfo) -> Self {
        self.status = StepStatus::Error;
        self.error = Some(error);
        self.finished_at = Utc::now();
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.status = StepStatus::Skipped;
        self.output = Value::String(reason.into());
        self.finished_at = Utc::now();
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_escalation(mut self, outcome: EscalationOutcome) -> Self {
        self.escalation = Some(outcome);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    Completed,
    Aborted,
    Stopped,
    Error,
}

/// Aggregate outcome of a script run, emitted exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub status: ScriptStatus,
    pub script_name: String,
    pub session_id: SessionId,
    pub step_results: Vec<StepResult>,
    pub duration_ms: u64,
    #[serde(default)]
    pub execution_stats: ExecutionStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_average_weights_by_tier() {
        let mut stats = ExecutionStats::default();
        stats.total_escalations = 4;
        stats.record_success(0);
        stats.record_success(1);
        stats.record_success(1);
        stats.record_success(2);
        assert!((stats.avg_escalation_level() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn step_result_builder_tracks_status() {
        let ok = StepResult::started(0, "navigate").succeed(Value::String("done".into()));
        assert!(ok.is_success());
        let failed = StepResult::started(1, "click")
            .fail(ErrorInfo::new("element_not_found", "no #submit"));
        assert_eq!(failed.status, StepStatus::Error);
        assert_eq!(failed.error.as_ref().unwrap().kind, "element_not_found");
    }
}
