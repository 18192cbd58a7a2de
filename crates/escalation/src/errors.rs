use thiserror::Error;
use wheelhouse_driver::DriverError;

#[derive(Debug, Error)]
pub enum EscalationError {
    /// Every rung of the chain failed or came back under threshold.
    #[error("all {attempts} escalation methods failed")]
    Exhausted { attempts: usize },

    #[error("no vision client configured")]
    VisionUnavailable,

    /// Per-run cap on paid vision calls was hit before this tier could run.
    #[error("vision call budget of {budget} exhausted")]
    VisionBudgetExceeded { budget: u64 },

    #[error("vision transport failed: {0}")]
    Http(String),

    #[error("vision response unusable: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl EscalationError {
    pub fn kind(&self) -> &'static str {
        match self {
            EscalationError::Exhausted { .. } => "escalation_exhausted",
            EscalationError::VisionUnavailable => "vision_unavailable",
            EscalationError::VisionBudgetExceeded { .. } => "vision_budget_exceeded",
            EscalationError::Http(_) => "vision_http",
            EscalationError::InvalidResponse(_) => "vision_invalid_response",
            EscalationError::Driver(err) => err.kind_str(),
        }
    }
}
