//! CDP-backed driver implementation for Chrome/Chromium/Edge.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chromiumoxide::browser::BrowserConfig;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use wheelhouse_core_types::WaitUntil;

use crate::channel::{extract_ws_url, CdpChannel};
use crate::config::LaunchOptions;
use crate::discovery::detect_browser_executable;
use crate::driver::{BrowserDriver, Cookie, PageInfo};
use crate::errors::{DriverError, DriverErrorKind};

const COMMAND_DEADLINE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const NETWORK_SETTLE: Duration = Duration::from_millis(500);

/// Driver bound to one page in a real browser.
///
/// The browser subprocess is owned by the underlying channel when we launched
/// it; attaching to a remote endpoint leaves process lifecycle to its owner.
pub struct ChromiumDriver {
    channel: Arc<CdpChannel>,
    session: String,
    target_id: String,
    current_url: RwLock<String>,
    navigations: broadcast::Sender<String>,
    watcher: JoinHandle<()>,
    closed: AtomicBool,
}

impl ChromiumDriver {
    /// Launch a browser (or attach to `options.cdp_url`) and open one page.
    pub async fn launch(options: LaunchOptions) -> Result<Self, DriverError> {
        let channel = if let Some(url) = &options.cdp_url {
            info!(target: "driver", url = %url, "attaching to remote browser");
            Arc::new(CdpChannel::connect(url, None).await?)
        } else {
            Arc::new(Self::spawn_browser(&options).await?)
        };
        Self::open_page(channel, &options).await
    }

    async fn spawn_browser(options: &LaunchOptions) -> Result<CdpChannel, DriverError> {
        let executable = options
            .executable
            .clone()
            .or_else(|| detect_browser_executable(options.browser_channel.as_deref()))
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::LaunchFailed, "launch").with_hint(
                    "no browser executable found; install Chrome/Chromium or set WHEELHOUSE_BROWSER",
                )
            })?;

        let user_data_dir = absolute(&options.user_data_dir)?;
        fs::create_dir_all(&user_data_dir).map_err(|err| {
            DriverError::new(DriverErrorKind::LaunchFailed, "launch")
                .with_hint(format!("cannot create user data dir: {err}"))
        })?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(COMMAND_DEADLINE)
            .launch_timeout(Duration::from_secs(20))
            .chrome_executable(executable)
            .user_data_dir(user_data_dir)
            .args(options.launch_args());
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|err| {
            DriverError::new(DriverErrorKind::LaunchFailed, "launch")
                .with_hint(format!("browser config error: {err}"))
        })?;

        let mut child = config.launch().map_err(|err| {
            DriverError::new(DriverErrorKind::LaunchFailed, "launch")
                .with_hint(format!("failed to spawn browser: {err}"))
        })?;
        let ws_url = extract_ws_url(&mut child).await?;
        info!(target: "driver", url = %ws_url, "browser launched");
        CdpChannel::connect(&ws_url, Some(child)).await
    }

    async fn open_page(channel: Arc<CdpChannel>, options: &LaunchOptions) -> Result<Self, DriverError> {
        channel
            .send(
                "Target.setDiscoverTargets",
                None,
                json!({ "discover": true }),
                COMMAND_DEADLINE,
            )
            .await?;

        let created = channel
            .send(
                "Target.createTarget",
                None,
                json!({ "url": "about:blank" }),
                COMMAND_DEADLINE,
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal, "launch")
                    .with_hint("createTarget missing targetId")
            })?
            .to_string();

        let attached = channel
            .send(
                "Target.attachToTarget",
                None,
                json!({ "targetId": target_id, "flatten": true }),
                COMMAND_DEADLINE,
            )
            .await?;
        let session = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal, "launch")
                    .with_hint("attachToTarget missing sessionId")
            })?
            .to_string();

        for method in ["Page.enable", "Runtime.enable"] {
            channel
                .send(method, Some(&session), json!({}), COMMAND_DEADLINE)
                .await?;
        }

        if options.ignore_https_errors {
            channel
                .send(
                    "Security.setIgnoreCertificateErrors",
                    Some(&session),
                    json!({ "ignore": true }),
                    COMMAND_DEADLINE,
                )
                .await?;
        }

        let viewport = options.viewport.clamped();
        channel
            .send(
                "Emulation.setDeviceMetricsOverride",
                Some(&session),
                json!({
                    "width": viewport.width,
                    "height": viewport.height,
                    "deviceScaleFactor": 1.0,
                    "mobile": false,
                }),
                COMMAND_DEADLINE,
            )
            .await?;

        if let Some(user_agent) = &options.user_agent {
            channel
                .send(
                    "Network.setUserAgentOverride",
                    Some(&session),
                    json!({ "userAgent": user_agent }),
                    COMMAND_DEADLINE,
                )
                .await?;
        }

        let (navigations, _) = broadcast::channel(64);
        let watcher = Self::spawn_navigation_watcher(&channel, navigations.clone());

        Ok(Self {
            channel,
            session,
            target_id,
            current_url: RwLock::new("about:blank".to_string()),
            navigations,
            watcher,
            closed: AtomicBool::new(false),
        })
    }

    fn spawn_navigation_watcher(
        channel: &Arc<CdpChannel>,
        navigations: broadcast::Sender<String>,
    ) -> JoinHandle<()> {
        let mut events = channel.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == "Page.frameNavigated" => {
                        let frame = &event.params["frame"];
                        // Main frame only; subframes carry a parentId.
                        if frame.get("parentId").is_some() {
                            continue;
                        }
                        if let Some(url) = frame.get("url").and_then(Value::as_str) {
                            let _ = navigations.send(url.to_string());
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn send_session(
        &self,
        op: &'static str,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(DriverError::closed(op));
        }
        self.channel
            .send(method, Some(&self.session), params, COMMAND_DEADLINE)
            .await
            .map_err(|mut err| {
                err.op = op;
                err
            })
    }

    /// `Runtime.evaluate` returning the value, mapping page exceptions to
    /// `EvaluationFailed`.
    async fn eval_value(&self, op: &'static str, expression: &str) -> Result<Value, DriverError> {
        let response = self
            .send_session(
                op,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "userGesture": true,
                }),
            )
            .await?;
        if let Some(details) = response.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("page exception");
            return Err(DriverError::new(DriverErrorKind::EvaluationFailed, op).with_hint(text));
        }
        Ok(response
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Poll a selector probe until it exists or the deadline passes.
    async fn await_element(
        &self,
        op: &'static str,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let probe = format!("!!({find})");
        let deadline = Instant::now() + timeout;
        loop {
            if self.eval_value(op, &probe).await? == Value::Bool(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::element_not_found(op, selector));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn element_rect(
        &self,
        op: &'static str,
        selector: &str,
    ) -> Result<(f64, f64, f64, f64), DriverError> {
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let expr = format!(
            "(() => {{ const el = {find}; if (!el) return null; \
             el.scrollIntoView({{block: 'center', inline: 'center'}}); \
             const r = el.getBoundingClientRect(); \
             return {{x: r.x, y: r.y, width: r.width, height: r.height}}; }})()"
        );
        let value = self.eval_value(op, &expr).await?;
        if value.is_null() {
            return Err(DriverError::element_not_found(op, selector));
        }
        let field = |name: &str| value.get(name).and_then(Value::as_f64).unwrap_or(0.0);
        Ok((field("x"), field("y"), field("width"), field("height")))
    }

    async fn ready_state(&self) -> Result<String, DriverError> {
        Ok(self
            .eval_value("wait", "document.readyState")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn wait_for_load(
        &self,
        wait_until: WaitUntil,
        deadline: Instant,
    ) -> Result<(), DriverError> {
        loop {
            let state = self.ready_state().await?;
            let ready = match wait_until {
                WaitUntil::DomContentLoaded => state == "interactive" || state == "complete",
                WaitUntil::NetworkIdle => state == "complete",
            };
            if ready {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DriverError::timeout("navigate")
                    .with_hint(format!("page stuck in readyState '{state}'")));
            }
            sleep(POLL_INTERVAL).await;
        }
        if wait_until == WaitUntil::NetworkIdle {
            // readyState says nothing about late XHR; give the page a short
            // settle window before declaring the network idle.
            sleep(NETWORK_SETTLE).await;
        }
        Ok(())
    }
}

fn absolute(path: &PathBuf) -> Result<PathBuf, DriverError> {
    if path.is_absolute() {
        return Ok(path.clone());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|err| {
            DriverError::new(DriverErrorKind::Internal, "launch")
                .with_hint(format!("cannot resolve cwd: {err}"))
        })
}

fn js_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| "\"\"".to_string())
}

/// JS expression resolving a compiled locator string to an element (or null).
/// Understands the `xpath=` and `text=` prefixes the locator spec compiles
/// to, plus the `nth=<i>:` wrapper selecting the i-th match; everything else
/// is treated as a CSS selector.
fn find_expr(literal: &str) -> String {
    format!(
        "((raw) => {{ \
         let sel = raw; \
         let index = 0; \
         const nth = sel.match(/^nth=(\\d+):/); \
         if (nth) {{ index = parseInt(nth[1], 10); sel = sel.slice(nth[0].length); }} \
         const matches = (() => {{ \
           if (sel.startsWith('xpath=')) {{ \
             const r = document.evaluate(sel.slice(6), document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
             const out = []; \
             for (let i = 0; i < r.snapshotLength; i++) out.push(r.snapshotItem(i)); \
             return out; \
           }} \
           if (sel.startsWith('text=')) {{ \
             const needle = sel.slice(5).trim().toLowerCase(); \
             if (!needle) return []; \
             const out = []; \
             const nodes = document.querySelectorAll('a, button, input, select, label, span, div, li, td, th, h1, h2, h3, h4, p'); \
             for (const n of nodes) {{ \
               const txt = (n.innerText || n.value || '').trim().toLowerCase(); \
               if (txt && txt.includes(needle)) out.push(n); \
             }} \
             return out; \
           }} \
           return Array.from(document.querySelectorAll(sel)); \
         }})(); \
         return index < matches.length ? matches[index] : null; \
        }})({literal})"
    )
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn goto(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        let response = self
            .send_session("navigate", "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(
                    DriverError::new(DriverErrorKind::NavigationFailed, "navigate")
                        .with_hint(error_text),
                );
            }
        }
        self.wait_for_load(wait_until, deadline).await?;
        *self.current_url.write() = url.to_string();
        debug!(target: "driver", url = %url, "navigation complete");
        Ok(())
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        self.await_element("click", selector, timeout).await?;
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let expr = format!(
            "(() => {{ const el = {find}; if (!el) return 'not-found'; \
             el.scrollIntoView({{block: 'center', inline: 'center'}}); el.click(); \
             return 'clicked'; }})()"
        );
        match self.eval_value("click", &expr).await?.as_str() {
            Some("clicked") => Ok(()),
            _ => Err(DriverError::element_not_found("click", selector)),
        }
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError> {
        for phase in ["mousePressed", "mouseReleased"] {
            self.send_session(
                "click_at",
                "Input.dispatchMouseEvent",
                json!({
                    "type": phase,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "buttons": 1,
                    "clickCount": 1,
                    "pointerType": "mouse",
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn fill(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.await_element("fill", selector, timeout).await?;
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let value_literal = js_string(value);
        // Go through the prototype value setter so framework-controlled
        // inputs observe the change.
        let expr = format!(
            "(() => {{ const el = {find}; if (!el) return 'not-found'; \
             el.focus(); \
             const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype; \
             const desc = Object.getOwnPropertyDescriptor(proto, 'value'); \
             if (desc && desc.set) {{ desc.set.call(el, {value_literal}); }} else {{ el.value = {value_literal}; }} \
             el.dispatchEvent(new Event('input', {{bubbles: true}})); \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); \
             return 'filled'; }})()"
        );
        match self.eval_value("fill", &expr).await?.as_str() {
            Some("filled") => Ok(()),
            _ => Err(DriverError::element_not_found("fill", selector)),
        }
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.await_element("type_text", selector, timeout).await?;
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let focus = format!(
            "(() => {{ const el = {find}; if (!el) return 'not-found'; \
             el.focus(); return 'focused'; }})()"
        );
        match self.eval_value("type_text", &focus).await?.as_str() {
            Some("focused") => {}
            _ => return Err(DriverError::element_not_found("type_text", selector)),
        }
        self.send_session("type_text", "Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let text = match key {
            "Enter" => Some("\r"),
            "Tab" => Some("\t"),
            _ => None,
        };
        let mut down = json!({ "type": "keyDown", "key": key });
        if let Some(text) = text {
            down["text"] = Value::String(text.to_string());
        }
        self.send_session("press", "Input.dispatchKeyEvent", down)
            .await?;
        self.send_session(
            "press",
            "Input.dispatchKeyEvent",
            json!({ "type": "keyUp", "key": key }),
        )
        .await?;
        Ok(())
    }

    async fn hover(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        self.await_element("hover", selector, timeout).await?;
        let (x, y, w, h) = self.element_rect("hover", selector).await?;
        self.send_session(
            "hover",
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseMoved",
                "x": x + w / 2.0,
                "y": y + h / 2.0,
                "pointerType": "mouse",
            }),
        )
        .await?;
        Ok(())
    }

    async fn select_option(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.await_element("select", selector, timeout).await?;
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let value_literal = js_string(value);
        let expr = format!(
            "(() => {{ const el = {find}; if (!el) return 'not-found'; \
             const options = Array.from(el.options || []); \
             let option = options.find(o => o.value === {value_literal}); \
             if (!option) option = options.find(o => o.text === {value_literal}); \
             if (!option) return 'option-missing'; \
             el.value = option.value; \
             el.dispatchEvent(new Event('input', {{bubbles: true}})); \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); \
             return 'selected'; }})()"
        );
        match self.eval_value("select", &expr).await?.as_str() {
            Some("selected") => Ok(()),
            Some("option-missing") => Err(DriverError::element_not_found("select", selector)
                .with_hint(format!("option '{value}' not present"))),
            _ => Err(DriverError::element_not_found("select", selector)),
        }
    }

    async fn scroll(&self, selector: Option<&str>, delta_y: i64) -> Result<(), DriverError> {
        match selector {
            Some(selector) => {
                let literal = js_string(selector);
                let find = find_expr(&literal);
                let expr = format!(
                    "(() => {{ const el = {find}; if (!el) return 'not-found'; \
                     el.scrollIntoView({{block: 'center'}}); return 'scrolled'; }})()"
                );
                match self.eval_value("scroll", &expr).await?.as_str() {
                    Some("scrolled") => Ok(()),
                    _ => Err(DriverError::element_not_found("scroll", selector)),
                }
            }
            None => {
                let expr = format!("window.scrollBy(0, {delta_y}); 'scrolled'");
                self.eval_value("scroll", &expr).await.map(|_| ())
            }
        }
    }

    async fn screenshot(&self, selector: Option<&str>) -> Result<Vec<u8>, DriverError> {
        let mut params = json!({ "format": "png" });
        if let Some(selector) = selector {
            let (x, y, width, height) = self.element_rect("screenshot", selector).await?;
            params["clip"] = json!({
                "x": x,
                "y": y,
                "width": width.max(1.0),
                "height": height.max(1.0),
                "scale": 1.0,
            });
        }
        let response = self
            .send_session("screenshot", "Page.captureScreenshot", params)
            .await?;
        let data = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal, "screenshot")
                    .with_hint("missing screenshot payload")
            })?;
        STANDARD.decode(data).map_err(|err| {
            DriverError::new(DriverErrorKind::Internal, "screenshot").with_hint(err.to_string())
        })
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        self.eval_value("evaluate", expression).await
    }

    async fn element_text(
        &self,
        selector: &str,
        attribute: Option<&str>,
    ) -> Result<String, DriverError> {
        let literal = js_string(selector);
        let find = find_expr(&literal);
        let expr = match attribute {
            Some(attribute) => {
                let attr_literal = js_string(attribute);
                format!(
                    "(() => {{ const el = {find}; if (!el) return null; \
                     return el.getAttribute({attr_literal}) || ''; }})()"
                )
            }
            None => format!(
                "(() => {{ const el = {find}; if (!el) return null; \
                 return (el.innerText || el.textContent || '').trim(); }})()"
            ),
        };
        match self.eval_value("extract", &expr).await? {
            Value::Null => Err(DriverError::element_not_found("extract", selector)),
            value => Ok(value.as_str().unwrap_or_default().to_string()),
        }
    }

    async fn cookies(&self, domain_filters: &[String]) -> Result<Vec<Cookie>, DriverError> {
        let response = self
            .send_session("cookies", "Network.getCookies", json!({}))
            .await?;
        let raw = response
            .get("cookies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut cookies = Vec::new();
        for entry in raw {
            let cookie = Cookie {
                name: entry
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                value: entry
                    .get("value")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                domain: entry
                    .get("domain")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                path: entry
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            let keep = domain_filters.is_empty()
                || domain_filters.iter().any(|d| cookie.domain.contains(d));
            if keep {
                cookies.push(cookie);
            }
        }
        Ok(cookies)
    }

    async fn local_storage_get(&self, key: &str) -> Result<Option<String>, DriverError> {
        let literal = js_string(key);
        let value = self
            .eval_value("local_storage", &format!("window.localStorage.getItem({literal})"))
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.await_element("wait_for_selector", selector, timeout)
            .await
            .map_err(|err| {
                if err.kind == DriverErrorKind::ElementNotFound {
                    DriverError::timeout("wait_for_selector")
                        .with_hint(format!("'{selector}' did not appear"))
                } else {
                    err
                }
            })
    }

    async fn page_info(&self) -> Result<PageInfo, DriverError> {
        let value = self
            .eval_value(
                "page_info",
                "({ title: document.title, url: window.location.href })",
            )
            .await?;
        Ok(PageInfo {
            title: value
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            url: value
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.current_url.read().clone())
    }

    fn subscribe_navigations(&self) -> broadcast::Receiver<String> {
        self.navigations.subscribe()
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.watcher.abort();
        if self.channel.is_alive() {
            let result = self
                .channel
                .send(
                    "Target.closeTarget",
                    None,
                    json!({ "targetId": self.target_id }),
                    Duration::from_secs(5),
                )
                .await;
            if let Err(err) = result {
                warn!(target: "driver", ?err, "closeTarget failed during shutdown");
            }
        }
        self.channel.shutdown().await;
        Ok(())
    }
}
