//! Shared primitives for the Wheelhouse automation core.
//!
//! Everything that crosses a crate boundary lives here: opaque identifiers,
//! the declarative script/step model, locator specs, step and script results,
//! and the runner event vocabulary the control plane fans out to observers.

mod ids;
mod locator;
mod result;
mod script;

pub mod events;

pub use ids::{ArtifactId, RunId, SessionId};
pub use locator::{LocatorKind, LocatorSpec};
pub use result::{
    ArtifactKind, ArtifactRef, ErrorInfo, EscalationOutcome, ExecutionStats, ScriptResult,
    ScriptStatus, StepResult, StepStatus, UploadState,
};
pub use script::{
    DomStrategy, ElementCheck, EscalationChain, EscalationMethod, MethodSpec, Script,
    SessionRequirements, Step, StepKind, ValidationMode, WaitUntil,
};
