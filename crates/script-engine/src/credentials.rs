use serde_json::Value;

/// Source of per-tool credentials merged into a step's execution context.
///
/// Resolution happens right before dispatch for steps carrying a `tool_name`
/// tag. A missing entry is not an error: the step proceeds without
/// credentials and handling their absence stays the caller's responsibility.
pub trait CredentialProvider: Send + Sync {
    fn credentials_for(&self, tool_name: &str) -> Option<Value>;
}

/// Provider with nothing to offer; every lookup misses.
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn credentials_for(&self, _tool_name: &str) -> Option<Value> {
        None
    }
}
