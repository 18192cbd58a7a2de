use std::sync::Arc;

use async_trait::async_trait;
use wheelhouse_driver::{BrowserDriver, ChromiumDriver, DriverError, LaunchOptions, StubDriver};

/// Indirection over driver construction so the session center can run
/// against a real browser, or a scripted double in tests and on hosts with
/// no browser installed.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, options: LaunchOptions) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}

/// Launches real Chromium-family browsers.
pub struct ChromiumFactory;

#[async_trait]
impl DriverFactory for ChromiumFactory {
    async fn launch(&self, options: LaunchOptions) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::new(ChromiumDriver::launch(options).await?))
    }
}

/// Hands out configurable stub drivers.
pub struct StubFactory {
    configure: Box<dyn Fn(StubDriver) -> StubDriver + Send + Sync>,
}

impl Default for StubFactory {
    fn default() -> Self {
        Self {
            configure: Box::new(|driver| driver),
        }
    }
}

impl StubFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Customize every driver this factory hands out.
    pub fn with(configure: impl Fn(StubDriver) -> StubDriver + Send + Sync + 'static) -> Self {
        Self {
            configure: Box::new(configure),
        }
    }
}

#[async_trait]
impl DriverFactory for StubFactory {
    async fn launch(&self, _options: LaunchOptions) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        Ok(Arc::new((self.configure)(StubDriver::new())))
    }
}
