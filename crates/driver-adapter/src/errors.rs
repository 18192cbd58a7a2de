use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// High-level error categories surfaced by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    #[error("browser launch failed")]
    LaunchFailed,
    #[error("operation timed out")]
    Timeout,
    #[error("navigation failed")]
    NavigationFailed,
    #[error("element not found")]
    ElementNotFound,
    #[error("script evaluation failed")]
    EvaluationFailed,
    #[error("browser context closed")]
    ContextClosed,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("internal driver error")]
    Internal,
}

/// Driver error enriched with the triggering operation for diagnosis.
#[derive(Clone, Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub op: &'static str,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, op: &'static str) -> Self {
        Self {
            kind,
            op,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    pub fn timeout(op: &'static str) -> Self {
        Self::new(DriverErrorKind::Timeout, op).retriable(true)
    }

    pub fn element_not_found(op: &'static str, selector: &str) -> Self {
        Self::new(DriverErrorKind::ElementNotFound, op)
            .with_hint(format!("no element matches '{selector}'"))
    }

    pub fn closed(op: &'static str) -> Self {
        Self::new(DriverErrorKind::ContextClosed, op)
    }

    /// Stable kind string for step results and observer events.
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            DriverErrorKind::LaunchFailed => "launch_failed",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::NavigationFailed => "navigation_failed",
            DriverErrorKind::ElementNotFound => "element_not_found",
            DriverErrorKind::EvaluationFailed => "evaluation_failed",
            DriverErrorKind::ContextClosed => "context_closed",
            DriverErrorKind::CdpIo => "cdp_io",
            DriverErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}", self.kind, self.op)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_operation_and_hint() {
        let err = DriverError::element_not_found("click", "#submit");
        let text = err.to_string();
        assert!(text.contains("click"));
        assert!(text.contains("#submit"));
        assert_eq!(err.kind_str(), "element_not_found");
    }
}
