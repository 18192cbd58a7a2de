//! REST surface of the control plane over a stub-driven session center.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::util::ServiceExt;
use wheelhouse::config::Config;
use wheelhouse::server::{build_router, AppState, SettingsStore};
use wheelhouse_artifact_store::ArtifactUploader;
use wheelhouse_profile_store::ProfileStore;
use wheelhouse_session_center::{CenterConfig, SessionCenter, StubFactory};

struct TestPlane {
    _dir: tempfile::TempDir,
    state: AppState,
}

fn test_plane() -> TestPlane {
    let dir = tempdir().unwrap();
    let config = Config {
        profiles_root: dir.path().join("profiles"),
        ..Default::default()
    };
    let store = Arc::new(ProfileStore::open(&config.profiles_root).unwrap());
    let center = SessionCenter::new(
        store,
        Arc::new(ArtifactUploader::disabled()),
        Arc::new(StubFactory::new()),
        None,
        None,
        CenterConfig::default(),
    );
    let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")));
    let state = AppState::new(Arc::new(config), center, settings);
    TestPlane { _dir: dir, state }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_session_count_and_uploader_state() {
    let plane = test_plane();
    let response = build_router(plane.state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "healthy");
    assert_eq!(payload["active_sessions"], 0);
    assert_eq!(payload["uploads_enabled"], false);
    assert_eq!(payload["api_key_configured"], false);
}

#[tokio::test]
async fn session_lifecycle_over_rest() {
    let plane = test_plane();
    let router = build_router(plane.state.clone());

    // Create.
    let response = router
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "headless": true }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    let session_id = payload["session_id"].as_str().unwrap().to_string();
    assert!(session_id.len() >= 33);
    assert_eq!(plane.state.center.session_count(), 1);

    // One-shot screenshot.
    let response = router
        .clone()
        .oneshot(
            Request::get(format!("/sessions/{session_id}/screenshot"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert!(payload["screenshot"].as_str().is_some());

    // Delete, twice: second returns 404.
    let response = router
        .clone()
        .oneshot(
            Request::delete(format!("/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = router
        .clone()
        .oneshot(
            Request::delete(format!("/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn settings_round_trip_masks_the_key() {
    let plane = test_plane();
    let router = build_router(plane.state.clone());

    let response = router
        .clone()
        .oneshot(
            Request::put("/settings")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "llm_api_key": "sk-secret-value-1234", "llm_model": "gpt-4o" })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(Request::get("/settings").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let payload = body_json(response).await;
    assert_eq!(payload["api_key_configured"], true);
    assert_eq!(payload["settings"]["llm_api_key"], "****1234");
    assert_eq!(payload["settings"]["llm_model"], "gpt-4o");
}

#[tokio::test]
async fn unknown_session_screenshot_is_404() {
    let plane = test_plane();
    let response = build_router(plane.state.clone())
        .oneshot(
            Request::get("/sessions/whs-does-not-exist/screenshot")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
