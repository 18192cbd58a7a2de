use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use wheelhouse_core_types::WaitUntil;

use crate::errors::DriverError;

/// A cookie as read from the browser, filtered by domain at the call site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// Snapshot of the current page for `get_page_info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub title: String,
    pub url: String,
}

/// Minimal capability surface the orchestration layers drive browsers
/// through. One driver instance owns exactly one page.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Navigate and wait for the requested load condition.
    async fn goto(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Click raw viewport coordinates; last resort for vision-located
    /// targets that resolved to nothing better.
    async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError>;

    /// Replace the field's value and fire input/change events.
    async fn fill(&self, selector: &str, value: &str, timeout: Duration)
        -> Result<(), DriverError>;

    /// Type into the focused element through the input pipeline.
    async fn type_text(&self, selector: &str, text: &str, timeout: Duration)
        -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn hover(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn select_option(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Scroll the page by `delta_y`, or bring `selector` into view.
    async fn scroll(&self, selector: Option<&str>, delta_y: i64) -> Result<(), DriverError>;

    /// PNG screenshot of the page or of one element.
    async fn screenshot(&self, selector: Option<&str>) -> Result<Vec<u8>, DriverError>;

    /// Evaluate an expression in the page; returns its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError>;

    /// Text content (or one attribute) of the first matching element.
    async fn element_text(
        &self,
        selector: &str,
        attribute: Option<&str>,
    ) -> Result<String, DriverError>;

    /// Cookies whose domain contains any of the given fragments (all cookies
    /// when the filter is empty).
    async fn cookies(&self, domain_filters: &[String]) -> Result<Vec<Cookie>, DriverError>;

    async fn local_storage_get(&self, key: &str) -> Result<Option<String>, DriverError>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<(), DriverError>;

    async fn page_info(&self) -> Result<PageInfo, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// Main-frame navigation notifications (new URL per event).
    fn subscribe_navigations(&self) -> broadcast::Receiver<String>;

    /// Idempotent teardown of the page and any owned subprocess.
    async fn close(&self) -> Result<(), DriverError>;
}
