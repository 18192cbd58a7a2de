use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use wheelhouse_core_types::{SessionId, SessionRequirements};
use wheelhouse_driver::browser_available;
use wheelhouse_session_center::SessionOptions;

use super::settings::SettingsUpdate;
use super::state::AppState;
use super::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route(
            "/sessions/:id",
            axum::routing::delete(delete_session),
        )
        .route("/sessions/:id/screenshot", get(session_screenshot))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/settings/test-api-key", post(test_api_key))
        .merge(ws::router())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "browser_available": browser_available(),
        "active_sessions": state.center.session_count(),
        "uploader_backlog": state.center.uploader().backlog(),
        "uploads_enabled": state.center.uploader().uploads_enabled(),
        "api_key_configured": state.settings.has_api_key(),
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct StartSessionRequest {
    #[serde(default)]
    pub headless: bool,
    pub profile_name: Option<String>,
    pub browser_channel: Option<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub clone_for_parallel: bool,
}

impl StartSessionRequest {
    pub(crate) fn into_options(self) -> SessionOptions {
        SessionOptions {
            headless: self.headless,
            requirements: SessionRequirements {
                profile_name: self.profile_name,
                required_tags: self.required_tags,
                clone_for_parallel: self.clone_for_parallel,
                browser_channel: self.browser_channel,
                ..Default::default()
            },
        }
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> impl IntoResponse {
    match state.center.open(request.into_options()).await {
        Ok(entry) => (
            StatusCode::OK,
            Json(json!({
                "status": "started",
                "session_id": entry.id.to_string(),
            })),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": err.to_string(), "error_kind": err.kind() })),
        ),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let session_id = SessionId(id.clone());
    match state.center.close(&session_id).await {
        Ok(true) => {
            state.seq.forget(&session_id);
            (
                StatusCode::OK,
                Json(json!({ "status": "closed", "session_id": id })),
            )
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Session not found" })),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": err.to_string() })),
        ),
    }
}

async fn session_screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let session_id = SessionId(id);
    let Some(entry) = state.center.lookup(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Session not found" })),
        );
    };
    match entry.driver.screenshot(None).await {
        Ok(bytes) => {
            let url = entry.driver.current_url().await.unwrap_or_default();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "screenshot": STANDARD.encode(bytes),
                    "url": url,
                })),
            )
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": err.to_string() })),
        ),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "settings": state.settings.masked(),
        "api_key_configured": state.settings.has_api_key(),
    }))
}

async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Json<Value> {
    state.settings.update(update);
    Json(json!({
        "status": "success",
        "message": "Settings updated",
        "api_key_configured": state.settings.has_api_key(),
    }))
}

/// Validate the configured vision API key with a minimal completion call.
async fn test_api_key(State(state): State<AppState>) -> Json<Value> {
    let Some(api_key) = state.settings.api_key() else {
        return Json(json!({ "status": "error", "message": "No API key configured" }));
    };
    let model = state
        .settings
        .llm_model()
        .unwrap_or_else(|| state.config.llm_model.clone());

    let client = reqwest::Client::new();
    let response = client
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(api_key)
        .json(&json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "Hi" }],
        }))
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            Json(json!({ "status": "success", "message": "API key is valid" }))
        }
        Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
            Json(json!({ "status": "error", "message": "Invalid API key" }))
        }
        Ok(response) => Json(json!({
            "status": "error",
            "message": format!("Unexpected response: {}", response.status()),
        })),
        Err(err) => Json(json!({
            "status": "error",
            "message": format!("Error testing API key: {err}"),
        })),
    }
}
