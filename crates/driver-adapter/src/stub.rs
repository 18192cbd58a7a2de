//! In-memory driver double.
//!
//! Models just enough of a page (present selectors, titles, canned script
//! results) for the orchestration layers to be exercised without a browser.
//! Also used on hosts where no browser binary exists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::sleep;
use wheelhouse_core_types::WaitUntil;

use crate::driver::{BrowserDriver, Cookie, PageInfo};
use crate::errors::{DriverError, DriverErrorKind};

// Smallest valid-enough PNG stand-in for screenshot payloads.
const STUB_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Default)]
struct StubState {
    url: String,
    title: String,
    elements: HashSet<String>,
    filled: HashMap<String, String>,
    selected: HashMap<String, String>,
    eval_results: HashMap<String, Value>,
    texts: HashMap<String, String>,
    page_titles: HashMap<String, String>,
    cookies: Vec<Cookie>,
    local_storage: HashMap<String, String>,
    screenshot_png: Vec<u8>,
    journal: Vec<String>,
    fail_once: HashMap<String, VecDeque<DriverError>>,
    closed: bool,
}

/// Scriptable fake browser.
pub struct StubDriver {
    state: Mutex<StubState>,
    navigations: broadcast::Sender<String>,
    op_delay: Mutex<Option<Duration>>,
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StubDriver {
    pub fn new() -> Self {
        let (navigations, _) = broadcast::channel(64);
        let state = StubState {
            url: "about:blank".to_string(),
            screenshot_png: STUB_PNG.to_vec(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            navigations,
            op_delay: Mutex::new(None),
        }
    }

    pub fn with_element(self, selector: impl Into<String>) -> Self {
        self.state.lock().elements.insert(selector.into());
        self
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.state.lock().title = title.into();
        self
    }

    /// Title the page takes on after navigating to `url`.
    pub fn with_page(self, url: impl Into<String>, title: impl Into<String>) -> Self {
        self.state.lock().page_titles.insert(url.into(), title.into());
        self
    }

    pub fn with_eval_result(self, expression: impl Into<String>, result: Value) -> Self {
        self.state.lock().eval_results.insert(expression.into(), result);
        self
    }

    /// Element present with the given text content.
    pub fn with_text(self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        let selector = selector.into();
        {
            let mut state = self.state.lock();
            state.elements.insert(selector.clone());
            state.texts.insert(selector, text.into());
        }
        self
    }

    pub fn with_cookie(self, cookie: Cookie) -> Self {
        self.state.lock().cookies.push(cookie);
        self
    }

    pub fn with_local_storage(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.lock().local_storage.insert(key.into(), value.into());
        self
    }

    /// Queue an error for the next invocation of `op`; later calls succeed.
    pub fn fail_once(&self, op: &str, error: DriverError) {
        self.state
            .lock()
            .fail_once
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    /// Slow every operation down, to make pause/stop windows observable.
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = Some(delay);
    }

    pub fn add_element(&self, selector: impl Into<String>) {
        self.state.lock().elements.insert(selector.into());
    }

    pub fn remove_element(&self, selector: &str) {
        self.state.lock().elements.remove(selector);
    }

    /// Ordered journal of operations, e.g. `click #submit`.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    pub fn filled_value(&self, selector: &str) -> Option<String> {
        self.state.lock().filled.get(selector).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn begin(&self, op: &'static str, detail: &str) -> Result<(), DriverError> {
        let delay = *self.op_delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::closed(op));
        }
        if let Some(queue) = state.fail_once.get_mut(op) {
            if let Some(error) = queue.pop_front() {
                state.journal.push(format!("{op} {detail} -> injected failure"));
                return Err(error);
            }
        }
        state.journal.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op} {detail}")
        });
        Ok(())
    }

    fn require_element(&self, op: &'static str, selector: &str) -> Result<(), DriverError> {
        if self.state.lock().elements.contains(selector) {
            Ok(())
        } else {
            Err(DriverError::element_not_found(op, selector))
        }
    }
}

#[async_trait]
impl BrowserDriver for StubDriver {
    async fn goto(
        &self,
        url: &str,
        _wait_until: WaitUntil,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.begin("navigate", url).await?;
        {
            let mut state = self.state.lock();
            state.url = url.to_string();
            if let Some(title) = state.page_titles.get(url).cloned() {
                state.title = title;
            }
        }
        let _ = self.navigations.send(url.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        self.begin("click", selector).await?;
        self.require_element("click", selector)
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError> {
        self.begin("click_at", &format!("{x},{y}")).await
    }

    async fn fill(
        &self,
        selector: &str,
        value: &str,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.begin("fill", selector).await?;
        self.require_element("fill", selector)?;
        self.state
            .lock()
            .filled
            .insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.begin("type_text", selector).await?;
        self.require_element("type_text", selector)?;
        self.state
            .lock()
            .filled
            .entry(selector.to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.begin("press", key).await
    }

    async fn hover(&self, selector: &str, _timeout: Duration) -> Result<(), DriverError> {
        self.begin("hover", selector).await?;
        self.require_element("hover", selector)
    }

    async fn select_option(
        &self,
        selector: &str,
        value: &str,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.begin("select", selector).await?;
        self.require_element("select", selector)?;
        self.state
            .lock()
            .selected
            .insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn scroll(&self, selector: Option<&str>, delta_y: i64) -> Result<(), DriverError> {
        let detail = selector.map(str::to_string).unwrap_or_else(|| delta_y.to_string());
        self.begin("scroll", &detail).await?;
        if let Some(selector) = selector {
            self.require_element("scroll", selector)?;
        }
        Ok(())
    }

    async fn screenshot(&self, selector: Option<&str>) -> Result<Vec<u8>, DriverError> {
        self.begin("screenshot", selector.unwrap_or("")).await?;
        if let Some(selector) = selector {
            self.require_element("screenshot", selector)?;
        }
        Ok(self.state.lock().screenshot_png.clone())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        self.begin("evaluate", expression).await?;
        let state = self.state.lock();
        if let Some(result) = state.eval_results.get(expression) {
            return Ok(result.clone());
        }
        // A couple of expressions the tiers lean on resolve naturally.
        match expression {
            "document.readyState" => Ok(Value::String("complete".into())),
            "document.title" => Ok(Value::String(state.title.clone())),
            "window.location.href" => Ok(Value::String(state.url.clone())),
            _ => Ok(Value::Null),
        }
    }

    async fn element_text(
        &self,
        selector: &str,
        _attribute: Option<&str>,
    ) -> Result<String, DriverError> {
        self.begin("extract", selector).await?;
        self.require_element("extract", selector)?;
        Ok(self
            .state
            .lock()
            .texts
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn cookies(&self, domain_filters: &[String]) -> Result<Vec<Cookie>, DriverError> {
        self.begin("cookies", "").await?;
        let state = self.state.lock();
        Ok(state
            .cookies
            .iter()
            .filter(|c| {
                domain_filters.is_empty()
                    || domain_filters.iter().any(|d| c.domain.contains(d))
            })
            .cloned()
            .collect())
    }

    async fn local_storage_get(&self, key: &str) -> Result<Option<String>, DriverError> {
        self.begin("local_storage", key).await?;
        Ok(self.state.lock().local_storage.get(key).cloned())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        self.begin("wait_for_selector", selector).await?;
        if self.state.lock().elements.contains(selector) {
            Ok(())
        } else {
            Err(DriverError::timeout("wait_for_selector")
                .with_hint(format!("'{selector}' did not appear")))
        }
    }

    async fn page_info(&self) -> Result<PageInfo, DriverError> {
        self.begin("page_info", "").await?;
        let state = self.state.lock();
        Ok(PageInfo {
            title: state.title.clone(),
            url: state.url.clone(),
        })
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.state.lock().url.clone())
    }

    fn subscribe_navigations(&self) -> broadcast::Receiver<String> {
        self.navigations.subscribe()
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.journal.push("close".to_string());
        Ok(())
    }
}
