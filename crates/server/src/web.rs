use std::sync::Arc;
use std::time::Instant;

use airbridge_protocol::BridgeConfig;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tower_http::limit::RequestBodyLimitLayer;

use crate::airplay::{self, AirPlayTracker};
use crate::controller::Controller;
use crate::debug::DebugHub;
use crate::monitor::{self, WindowObservation};
use crate::recording::{self, Recorder, StartError};
use crate::signaling::{self, SignalContext};

/// Shared application state.
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub controller: Arc<Controller>,
    pub airplay: Arc<AirPlayTracker>,
    pub debug: Arc<DebugHub>,
    pub recorder: Recorder,
    pub window_rx: watch::Receiver<WindowObservation>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/webrtc/status", get(webrtc_status))
        .route("/api/webrtc/cleanup", post(webrtc_cleanup))
        .route("/api/webrtc/signal", get(signal_upgrade))
        .route("/api/airplay/status", get(airplay_status))
        .route("/api/airplay/diagnostics", get(airplay_diagnostics))
        .route("/api/airplay/logs", get(airplay_logs))
        .route("/api/debug/stream", get(debug_stream))
        .route("/api/debug/save", post(debug_save))
        .route("/api/debug/start", post(debug_start))
        .route("/api/debug/stop", post(debug_stop))
        .route("/api/record/start", post(record_start))
        .route("/api/record/stop", post(record_stop))
        .route("/api/record/status", get(record_status))
        .route("/api/records", get(records_list))
        .route(
            "/api/records/{filename}",
            get(record_download).delete(record_delete),
        )
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn webrtc_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

async fn webrtc_cleanup(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("manual WebRTC cleanup requested");
    state.controller.admin_cleanup().await;
    Json(json!({
        "status": "cleaned",
        "message": "WebRTC session cleaned up successfully",
    }))
}

/// GET /api/webrtc/signal
///
/// The slot is reserved before the upgrade so a losing client gets a plain
/// HTTP conflict instead of a socket that immediately closes.
async fn signal_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.controller.reserve().await {
        Ok(reservation) => {
            let ctx = SignalContext {
                config: Arc::clone(&state.config),
                controller: Arc::clone(&state.controller),
                debug: Arc::clone(&state.debug),
                window_rx: state.window_rx.clone(),
            };
            ws.on_upgrade(move |socket| signaling::handle_socket(socket, ctx, reservation))
        }
        Err(e) => {
            tracing::warn!("rejecting signaling connection: {e}");
            (StatusCode::CONFLICT, "WebRTC session already active").into_response()
        }
    }
}

async fn airplay_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let obs = state.window_rx.borrow().clone();
    Json(json!({
        "state": state.airplay.snapshot(),
        "diagnostics": {
            "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
            "windows_count": if obs.present { 1 } else { 0 },
            "last_check": Utc::now(),
        },
    }))
}

async fn airplay_diagnostics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Fresh probe, independent of the monitor's cadence.
    let obs = monitor::probe(&state.config.capture).await;
    let live_window = if obs.present {
        json!({ "id": obs.id, "width": obs.width, "height": obs.height })
    } else {
        serde_json::Value::Null
    };
    let processes = airplay::receiver_processes(&state.config.capture).await;
    Json(json!({
        "timestamp": Utc::now(),
        "current_state": state.airplay.snapshot(),
        "live_window": live_window,
        "processes": processes,
        "system_info": {
            "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        },
    }))
}

async fn airplay_logs(State(state): State<Arc<AppState>>) -> Response {
    match airplay::receiver_log_tail(&state.config.paths).await {
        Ok((path, lines)) => Json(json!({
            "timestamp": Utc::now(),
            "logs": lines,
            "logs_file": path,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read receiver logs: {e:#}"),
        )
            .into_response(),
    }
}

async fn debug_stream(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let hub = Arc::clone(&state.debug);
    ws.on_upgrade(move |socket| crate::debug::handle_stream_socket(socket, hub))
}

async fn debug_save(State(state): State<Arc<AppState>>) -> Response {
    let path = state.config.paths.debug_log_file.clone();
    match state.debug.save_to_file(&path).await {
        Ok(()) => Json(json!({
            "status": "success",
            "message": "Debug log saved",
            "file": path,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save debug log: {e:#}"),
        )
            .into_response(),
    }
}

async fn debug_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.debug.set_enabled(true);
    state
        .debug
        .info("DEBUG", "logging_started", "debug logging started by user");
    Json(json!({
        "status": "success",
        "message": "Debug logging started",
        "enabled": true,
        "timestamp": Utc::now(),
    }))
}

async fn debug_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .debug
        .info("DEBUG", "logging_stopped", "debug logging stopped by user");
    state.debug.set_enabled(false);
    Json(json!({
        "status": "success",
        "message": "Debug logging stopped",
        "enabled": false,
        "timestamp": Utc::now(),
    }))
}

#[derive(Deserialize)]
struct StartRecordRequest {
    #[serde(default)]
    filename: Option<String>,
}

async fn record_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRecordRequest>,
) -> Response {
    match state.recorder.start(req.filename).await {
        Ok((file, started_at)) => Json(json!({
            "status": "recording",
            "file": file,
            "startedAt": started_at,
        }))
        .into_response(),
        Err(StartError::AlreadyRecording) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Recording already in progress" })),
        )
            .into_response(),
        Err(StartError::Other(e)) => {
            tracing::error!("failed to start recording: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to start recording" })),
            )
                .into_response()
        }
    }
}

async fn record_stop(State(state): State<Arc<AppState>>) -> Response {
    match state.recorder.stop().await {
        Ok((file, duration)) => Json(json!({
            "status": "stopped",
            "file": file,
            "duration": duration,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn record_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.recorder.status().await {
        Some((file, started_at)) => Json(json!({
            "recording": true,
            "file": file,
            "startedAt": started_at,
        })),
        None => Json(json!({ "recording": false })),
    }
}

async fn records_list(State(state): State<Arc<AppState>>) -> Response {
    match state.recorder.list().await {
        Ok(files) => Json(files).into_response(),
        Err(e) => {
            tracing::error!("failed to list recordings: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to list records" })),
            )
                .into_response()
        }
    }
}

async fn record_download(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    if !recording::valid_filename(&filename) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid filename" })),
        )
            .into_response();
    }
    let path = state.recorder.path_of(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "File not found" })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("failed to open recording {filename}: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to read file" })),
            )
                .into_response();
        }
    };

    let body = Body::from_stream(ReaderStream::new(file));
    (
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

async fn record_delete(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    if !recording::valid_filename(&filename) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid filename" })),
        )
            .into_response();
    }
    let path = state.recorder.path_of(&filename);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Json(json!({ "status": "deleted", "file": filename })).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "File not found" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to delete recording {filename}: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to delete file" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airbridge_protocol::BridgeConfig;
    use axum::body::Body as ReqBody;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = Arc::new(BridgeConfig::default());
        let debug = Arc::new(DebugHub::new());
        let controller = Controller::new(config.reconnect.clone(), Arc::clone(&debug));
        let (_tx, window_rx) = watch::channel(WindowObservation::default());
        Arc::new(AppState {
            recorder: Recorder::new("/tmp/airbridge-web-test-records", ":0"),
            config,
            controller,
            airplay: Arc::new(AirPlayTracker::new()),
            debug,
            window_rx,
            started_at: Instant::now(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/api/health").body(ReqBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_no_session_when_idle() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/api/webrtc/status")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["active"], false);
        assert_eq!(json["hasSession"], false);
    }

    #[tokio::test]
    async fn stop_without_recording_is_bad_request() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::post("/api/record/stop")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn records_list_is_empty_without_dir() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/api/records").body(ReqBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn deleting_a_bad_filename_is_rejected() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::delete("/api/records/..%2Fescape.mp4")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(
            response.status() == StatusCode::BAD_REQUEST
                || response.status() == StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn deleting_a_missing_recording_is_not_found() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::delete("/api/records/missing.mp4")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn record_status_reports_idle() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/api/record/status")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["recording"], false);
    }

    #[tokio::test]
    async fn cleanup_when_idle_still_succeeds() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::post("/api/webrtc/cleanup")
                    .body(ReqBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "cleaned");
    }
}
