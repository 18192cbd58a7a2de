//! Wheelhouse: browser automation orchestration core.
//!
//! The library surface wires the workspace subsystems together for the
//! binary and for integration tests: configuration, the consolidated-secret
//! credential source, and the axum control plane.

pub mod cli;
pub mod config;
pub mod secrets;
pub mod server;

pub use config::Config;
pub use secrets::FileSecretSource;
