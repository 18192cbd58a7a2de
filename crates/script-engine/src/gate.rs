use async_trait::async_trait;

/// Hook the runner awaits when a script asks for a human to complete a login
/// before the steps run. Headless deployments pass [`NoGate`]; the CLI blocks
/// on operator confirmation.
#[async_trait]
pub trait LoginGate: Send + Sync {
    async fn wait_for_login(&self);
}

/// Gate that opens immediately.
pub struct NoGate;

#[async_trait]
impl LoginGate for NoGate {
    async fn wait_for_login(&self) {}
}
