//! Progressive escalation engine.
//!
//! For one abstract action ("click the thing that does X", "is the user
//! logged in") the engine walks an ordered chain of methods from free DOM
//! checks up through paid vision calls, stopping at the first rung whose
//! result clears its confidence threshold. A correctly configured chain
//! resolves most actions at the structural tiers; vision is the tail.

mod context;
mod engine;
mod errors;
mod vision;

pub use context::{interpolate, ExecContext};
pub use engine::{EscalationEngine, EscalationSuccess, ResolvedTarget};
pub use errors::EscalationError;
pub use vision::{
    HttpVisionClient, MockVisionClient, VisionClient, VisionDecision, VisionLocation,
    VISION_CALL_COST,
};
