//! Session lifecycle: maps opaque session ids to live browser sessions,
//! enforces profile exclusivity, and drains everything at shutdown.
//!
//! Sessions are fully concurrent with each other; within one session,
//! control commands serialize through the entry's command lock.

mod center;
mod entry;
mod errors;
mod factory;

pub use center::{CenterConfig, SessionCenter, SessionOptions};
pub use entry::{RecordedStep, SessionEntry};
pub use errors::SessionError;
pub use factory::{ChromiumFactory, DriverFactory, StubFactory};
