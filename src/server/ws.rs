//! Streaming control channel.
//!
//! Clients send `{action, session_id?, ...}` messages; the server answers
//! with typed events and fans out runner events for every session this
//! connection has touched. Outbound queues are bounded: a consumer that
//! cannot keep up is disconnected instead of ever blocking a runner.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wheelhouse_core_types::{Script, SessionId, Step, WaitUntil};
use wheelhouse_session_center::SessionEntry;

use super::events::{bare_error, envelope, runner_event};
use super::router::StartSessionRequest;
use super::state::AppState;

const OUTBOUND_QUEUE: usize = 128;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, state))
}

/// Bounded, non-blocking sender to one client.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<Value>,
    dropped: CancellationToken,
}

impl Outbound {
    fn send(&self, payload: Value) {
        if self.tx.try_send(payload).is_err() {
            // Never block a runner on observer I/O: drop the connection.
            warn!(target: "server", "outbound queue full, dropping observer");
            self.dropped.cancel();
        }
    }
}

async fn connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE);
    let dropped = CancellationToken::new();
    let out = Outbound {
        tx,
        dropped: dropped.clone(),
    };

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<SessionId, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = dropped.cancelled() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&state, &out, &mut forwarders, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(target: "server", error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    writer.abort();
}

/// Stream a session's runner events to this connection.
fn ensure_forwarder(
    state: &AppState,
    out: &Outbound,
    forwarders: &mut HashMap<SessionId, JoinHandle<()>>,
    entry: &Arc<SessionEntry>,
) {
    if forwarders.contains_key(&entry.id) {
        return;
    }
    let mut events = entry.subscribe();
    let out = out.clone();
    let seq = Arc::clone(&state.seq);
    let session_id = entry.id.clone();
    let handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => out.send(runner_event(&seq, &session_id, &event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "server",
                        session = %session_id,
                        skipped,
                        "event forwarder lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    forwarders.insert(entry.id.clone(), handle);
}

fn session_from(state: &AppState, data: &Value) -> Result<Arc<SessionEntry>, Value> {
    let Some(raw) = data.get("session_id").and_then(Value::as_str) else {
        return Err(bare_error("missing session_id"));
    };
    let session_id = SessionId(raw.to_string());
    state
        .center
        .lookup(&session_id)
        .ok_or_else(|| bare_error(format!("unknown session: {raw}")))
}

async fn handle_message(
    state: &AppState,
    out: &Outbound,
    forwarders: &mut HashMap<SessionId, JoinHandle<()>>,
    text: &str,
) {
    let data: Value = match serde_json::from_str(text) {
        Ok(data) => data,
        Err(err) => {
            out.send(bare_error(format!("invalid message: {err}")));
            return;
        }
    };
    let Some(action) = data.get("action").and_then(Value::as_str) else {
        out.send(bare_error("missing action"));
        return;
    };

    match action {
        "ping" => out.send(json!({ "type": "pong" })),

        "start_session" => {
            let request: StartSessionRequest = match serde_json::from_value(data.clone()) {
                Ok(request) => request,
                Err(err) => {
                    out.send(bare_error(format!("invalid start_session: {err}")));
                    return;
                }
            };
            match state.center.open(request.into_options()).await {
                Ok(entry) => {
                    ensure_forwarder(state, out, forwarders, &entry);
                    out.send(envelope(
                        &state.seq,
                        &entry.id,
                        json!({ "type": "session_started", "status": "started" }),
                    ));
                }
                Err(err) => out.send(bare_error(err.to_string())),
            }
        }

        "close_session" => match session_from(state, &data) {
            Ok(entry) => {
                let _ = state.center.close(&entry.id).await;
                if let Some(forwarder) = forwarders.remove(&entry.id) {
                    forwarder.abort();
                }
                out.send(envelope(
                    &state.seq,
                    &entry.id,
                    json!({ "type": "session_closed" }),
                ));
                state.seq.forget(&entry.id);
            }
            Err(error) => out.send(error),
        },

        "navigate" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let url = data.get("url").and_then(Value::as_str).unwrap_or_default();
                let _guard = entry.serialize_command().await;
                let payload = match entry
                    .driver
                    .goto(url, WaitUntil::DomContentLoaded, state.config.step_timeout())
                    .await
                {
                    Ok(()) => {
                        entry.record("navigate", json!({ "url": url }));
                        json!({ "type": "navigate_complete", "status": "success", "url": url })
                    }
                    Err(err) => {
                        json!({ "type": "navigate_complete", "error": err.to_string() })
                    }
                };
                out.send(envelope(&state.seq, &entry.id, payload));
            }
            Err(error) => out.send(error),
        },

        "click" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let selector = data
                    .get("selector")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let _guard = entry.serialize_command().await;
                let payload = match entry
                    .driver
                    .click(selector, state.config.step_timeout())
                    .await
                {
                    Ok(()) => {
                        entry.record(
                            "click",
                            json!({ "locator": { "strategy": "selector", "value": selector } }),
                        );
                        json!({ "type": "click_complete", "status": "success" })
                    }
                    Err(err) => json!({ "type": "click_complete", "error": err.to_string() }),
                };
                out.send(envelope(&state.seq, &entry.id, payload));
            }
            Err(error) => out.send(error),
        },

        "fill" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let selector = data
                    .get("selector")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let value = data.get("value").and_then(Value::as_str).unwrap_or_default();
                let _guard = entry.serialize_command().await;
                let payload = match entry
                    .driver
                    .fill(selector, value, state.config.step_timeout())
                    .await
                {
                    Ok(()) => {
                        entry.record(
                            "fill",
                            json!({
                                "locator": { "strategy": "selector", "value": selector },
                                "value": value,
                            }),
                        );
                        json!({ "type": "fill_complete", "status": "success" })
                    }
                    Err(err) => json!({ "type": "fill_complete", "error": err.to_string() }),
                };
                out.send(envelope(&state.seq, &entry.id, payload));
            }
            Err(error) => out.send(error),
        },

        "screenshot" => match session_from(state, &data) {
            Ok(entry) => {
                let _guard = entry.serialize_command().await;
                let payload = match entry.driver.screenshot(None).await {
                    Ok(bytes) => {
                        let url = entry.driver.current_url().await.unwrap_or_default();
                        json!({
                            "type": "screenshot",
                            "status": "success",
                            "screenshot": STANDARD.encode(bytes),
                            "url": url,
                        })
                    }
                    Err(err) => json!({ "type": "screenshot", "error": err.to_string() }),
                };
                out.send(envelope(&state.seq, &entry.id, payload));
            }
            Err(error) => out.send(error),
        },

        "get_page_info" => match session_from(state, &data) {
            Ok(entry) => {
                let payload = match entry.driver.page_info().await {
                    Ok(info) => json!({
                        "type": "page_info",
                        "title": info.title,
                        "url": info.url,
                        "is_recording": entry.is_recording(),
                    }),
                    Err(err) => json!({ "type": "page_info", "error": err.to_string() }),
                };
                out.send(envelope(&state.seq, &entry.id, payload));
            }
            Err(error) => out.send(error),
        },

        "start_recording" => match session_from(state, &data) {
            Ok(entry) => {
                entry.start_recording();
                out.send(envelope(
                    &state.seq,
                    &entry.id,
                    json!({ "type": "recording_status", "status": "recording_started" }),
                ));
            }
            Err(error) => out.send(error),
        },

        "stop_recording" => match session_from(state, &data) {
            Ok(entry) => {
                let steps = entry.stop_recording();
                out.send(envelope(
                    &state.seq,
                    &entry.id,
                    json!({
                        "type": "recording_complete",
                        "status": "recording_stopped",
                        "steps": steps,
                    }),
                ));
            }
            Err(error) => out.send(error),
        },

        "execute_script" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let script: Script =
                    match serde_json::from_value(data.get("script").cloned().unwrap_or_default()) {
                        Ok(script) => script,
                        Err(err) => {
                            out.send(bare_error(format!("invalid script: {err}")));
                            return;
                        }
                    };
                // Run in the background so control commands keep flowing on
                // this connection; results stream back as runner events.
                let center = Arc::clone(&state.center);
                let out = out.clone();
                tokio::spawn(async move {
                    if let Err(err) = center.run_script(&entry, script, None).await {
                        out.send(bare_error(err.to_string()));
                    }
                });
            }
            Err(error) => out.send(error),
        },

        "execute_step" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let step: Step =
                    match serde_json::from_value(data.get("step").cloned().unwrap_or_default()) {
                        Ok(step) => step,
                        Err(err) => {
                            out.send(bare_error(format!("invalid step: {err}")));
                            return;
                        }
                    };
                let _guard = entry.serialize_command().await;
                match state.center.execute_single_step(&entry, step).await {
                    Ok(result) => out.send(envelope(
                        &state.seq,
                        &entry.id,
                        json!({
                            "type": "step_complete",
                            "step_index": result.step_index,
                            "result": result,
                        }),
                    )),
                    Err(err) => out.send(bare_error(err.to_string())),
                }
            }
            Err(error) => out.send(error),
        },

        "pause_script" | "resume_script" | "stop_script" => match session_from(state, &data) {
            Ok(entry) => {
                ensure_forwarder(state, out, forwarders, &entry);
                let applied = entry.runner_handle().map(|handle| match action {
                    "pause_script" => handle.pause(),
                    "resume_script" => handle.resume(),
                    _ => handle.stop(),
                });
                // The handle emits the script_paused/resumed/stopped event;
                // here we only surface the no-script case.
                if applied != Some(true) {
                    out.send(bare_error("No script running"));
                }
            }
            Err(error) => out.send(error),
        },

        other => {
            out.send(json!({ "type": "error", "error": "unknown action", "action": other }));
        }
    }
}
