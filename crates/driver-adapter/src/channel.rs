//! Raw CDP command/event channel shared by every [`crate::ChromiumDriver`].
//!
//! One background task owns the websocket connection: commands are submitted
//! through an mpsc queue and matched to responses by call id; protocol events
//! are re-broadcast to whoever subscribed.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::async_process::Child;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::{DriverError, DriverErrorKind};

/// One decoded CDP protocol event.
#[derive(Clone, Debug)]
pub(crate) struct CdpEvent {
    pub method: String,
    pub params: Value,
    #[allow(dead_code)]
    pub session_id: Option<String>,
}

struct CommandRequest {
    method: String,
    session_id: Option<String>,
    params: Value,
    responder: oneshot::Sender<Result<Value, DriverError>>,
}

/// Live connection to one browser process (or remote endpoint).
pub(crate) struct CdpChannel {
    command_tx: mpsc::Sender<CommandRequest>,
    events: broadcast::Sender<CdpEvent>,
    alive: Arc<AtomicBool>,
    loop_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl CdpChannel {
    /// Connect to the devtools websocket; `child` is the owned subprocess
    /// when we launched the browser ourselves.
    pub async fn connect(ws_url: &str, child: Option<Child>) -> Result<Self, DriverError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| {
                DriverError::new(DriverErrorKind::CdpIo, "connect").with_hint(err.to_string())
            })?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events, _) = broadcast::channel(512);
        let alive = Arc::new(AtomicBool::new(true));

        let loop_alive = alive.clone();
        let loop_events = events.clone();
        let loop_task = tokio::spawn(async move {
            if let Err(err) = Self::run_loop(conn, command_rx, loop_events).await {
                error!(target: "driver", ?err, "cdp channel loop terminated");
            }
            loop_alive.store(false, Ordering::Relaxed);
        });

        debug!(target: "driver", url = %ws_url, "cdp channel connected");

        Ok(Self {
            command_tx,
            events,
            alive,
            loop_task,
            child: Mutex::new(child),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Send a command and await its response within `deadline`.
    pub async fn send(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        if !self.is_alive() {
            return Err(DriverError::closed("send"));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let request = CommandRequest {
            method: method.to_string(),
            session_id: session_id.map(str::to_string),
            params,
            responder: resp_tx,
        };
        self.command_tx.send(request).await.map_err(|_| {
            DriverError::closed("send").with_hint("cdp command queue closed")
        })?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::closed("send").with_hint("response channel dropped")),
            Err(_) => Err(DriverError::timeout("send").with_hint(format!("{method} timed out"))),
        }
    }

    /// Tear the channel down and kill an owned subprocess.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "driver", ?err, "failed to kill browser subprocess");
            }
        }
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<CommandRequest>,
        events: broadcast::Sender<CdpEvent>,
    ) -> Result<(), DriverError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                request = command_rx.recv() => {
                    let Some(request) = request else {
                        // Every handle dropped; nothing left to serve.
                        return Ok(());
                    };
                    let method_id: MethodId = request.method.clone().into();
                    let session = request
                        .session_id
                        .map(chromiumoxide::cdp::browser_protocol::target::SessionId::from);
                    match conn.submit_command(method_id, session, request.params) {
                        Ok(call_id) => {
                            inflight.insert(call_id, request.responder);
                        }
                        Err(err) => {
                            let _ = request.responder.send(Err(
                                DriverError::new(DriverErrorKind::CdpIo, "submit")
                                    .with_hint(err.to_string()),
                            ));
                        }
                    }
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(response))) => {
                            Self::route_response(response, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            Self::route_event(event, &events);
                        }
                        Some(Err(err)) => {
                            let failure = DriverError::new(DriverErrorKind::CdpIo, "recv")
                                .with_hint(err.to_string())
                                .retriable(true);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(failure.clone()));
                            }
                            return Err(failure);
                        }
                        None => {
                            let closed = DriverError::closed("recv")
                                .with_hint("cdp connection closed by peer");
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(closed.clone()));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn route_response(
        response: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>>,
    ) {
        let Some(sender) = inflight.remove(&response.id) else {
            return;
        };
        let outcome = if let Some(result) = response.result {
            Ok(result)
        } else if let Some(error) = response.error {
            Err(DriverError::new(DriverErrorKind::CdpIo, "command")
                .with_hint(format!("cdp error {}: {}", error.code, error.message))
                .retriable(error.code >= 500))
        } else {
            Err(DriverError::new(DriverErrorKind::Internal, "command")
                .with_hint("empty cdp response"))
        };
        let _ = sender.send(outcome);
    }

    fn route_event(event: CdpEventMessage, events: &broadcast::Sender<CdpEvent>) {
        match TryInto::<CdpJsonEventMessage>::try_into(event) {
            Ok(raw) => {
                let _ = events.send(CdpEvent {
                    method: raw.method.into_owned(),
                    params: raw.params,
                    session_id: raw.session_id,
                });
            }
            Err(err) => {
                warn!(target: "driver", ?err, "failed to decode cdp event");
            }
        }
    }
}

impl Drop for CdpChannel {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = child.kill().await;
                    });
                }
            }
        }
    }
}

/// Read the devtools websocket URL off the launched browser's stderr.
pub(crate) async fn extract_ws_url(child: &mut Child) -> Result<String, DriverError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        DriverError::new(DriverErrorKind::LaunchFailed, "launch")
            .with_hint("browser process missing stderr handle")
    })?;
    let mut lines = BufReader::new(stderr).lines();

    let reader = async {
        let mut preview = Vec::new();
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                DriverError::new(DriverErrorKind::LaunchFailed, "launch")
                    .with_hint(err.to_string())
            })?;
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
            if preview.len() < 8 {
                preview.push(line);
            }
        }
        Err(
            DriverError::new(DriverErrorKind::LaunchFailed, "launch").with_hint(format!(
                "browser exited before exposing devtools url; stderr: {}",
                preview.join(" | ")
            )),
        )
    };

    tokio::time::timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| {
            DriverError::timeout("launch").with_hint("waiting for devtools websocket url")
        })?
}
