use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use stagegate_common::{DecisionRequest, GateToken, SessionId, SessionStatus};

use super::sse;
use crate::errors::{EngineError, GateError, StoreError};
use crate::pipeline::Engine;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<Engine>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct StartSessionRequest {
    pub input_document: String,
}

#[derive(Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

#[derive(Deserialize)]
pub struct SubmitDecisionRequest {
    pub token: GateToken,
    pub decision: String,
    #[serde(default)]
    pub feedback: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Store(StoreError::NotFound { .. }) | EngineError::ArtifactNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        EngineError::Gate(GateError::MalformedDecision { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Gate(_)
        | EngineError::Store(StoreError::VersionConflict { .. })
        | EngineError::ConflictRetriesExhausted { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Engine(err) => (status_for(&err), err.kind(), err.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(%kind, error = %message, "request failed");
        }
        (status, Json(serde_json::json!({"error": message, "kind": kind}))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id '{}'", raw)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/{id}", get(get_status))
        .route("/api/sessions/{id}/decision", post(submit_decision))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/events", get(sse::stream_events))
        .route("/api/sessions/{id}/log", get(event_log))
        .route("/api/sessions/{id}/artifacts/{key}", get(get_artifact))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.engine.list_sessions().await?;
    Ok(Json(sessions))
}

async fn start_session(
    State(state): State<SharedState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.input_document.trim().is_empty() {
        return Err(ApiError::BadRequest("input_document must not be empty".into()));
    }
    let session = state.engine.create_session(req.input_document).await?;
    state.engine.spawn_drive(session.session_id);
    Ok((
        StatusCode::CREATED,
        Json(StartSessionResponse {
            session_id: session.session_id,
            status: session.status(),
        }),
    ))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_status(id).await?))
}

async fn submit_decision(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitDecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let request = DecisionRequest::new(req.decision, req.feedback);
    let status = state.engine.submit_decision(id, req.token, &request).await?;
    if !status.state.is_terminal() && status.pending_gate.is_none() {
        state.engine.spawn_drive(id);
    }
    Ok(Json(status))
}

/// Restart a session that is running with no worker behind it.
async fn resume_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let status = state.engine.get_status(id).await?;
    if status.state.is_terminal() {
        return Err(EngineError::from(GateError::SessionClosed {
            stage: status.current_stage,
        })
        .into());
    }
    if status.pending_gate.is_none() {
        state.engine.spawn_drive(id);
    }
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn event_log(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.event_log(id).await?))
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_artifact(id, &key).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::EngineSettings;
    use crate::store::{MemorySessionStore, SharedStore};
    use crate::worker::{RetryPolicy, ScriptedStageWorker, ScriptedSubtasks, SubtaskRegistry, Workers};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use stagegate_common::{RunState, Stage};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_engine() -> Arc<Engine> {
        let store: SharedStore = Arc::new(MemorySessionStore::new());
        let workers = Workers::new(
            Arc::new(ScriptedStageWorker::new().with_output(Stage::Requirements, json!({"summary": "X"}))),
            SubtaskRegistry::new(Arc::new(ScriptedSubtasks::new())),
        );
        let settings = EngineSettings::default().with_retry_policy(RetryPolicy::immediate());
        Arc::new(Engine::new(store, workers, settings))
    }

    fn test_app(engine: Arc<Engine>) -> Router {
        api_router().with_state(Arc::new(AppState { engine }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn suspended_session(engine: &Engine) -> (SessionId, GateToken) {
        let id = engine.create_session("doc").await.unwrap().session_id;
        let status = engine.drive(id).await.unwrap();
        (id, status.pending_gate.unwrap().lock_token)
    }

    fn decision(id: SessionId, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{}/decision", id))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(test_engine());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_start_session_then_await_gate() {
        let engine = test_engine();
        let app = test_app(engine.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(json!({"input_document": "build X"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let started: StartSessionResponse = body_json(response.into_body()).await;
        assert_eq!(started.status.current_stage, Stage::Requirements);

        // The pipeline is driven in the background.
        let mut status = None;
        for _ in 0..100 {
            let request = Request::builder()
                .uri(format!("/api/sessions/{}", started.session_id))
                .body(Body::empty())
                .unwrap();
            let current: SessionStatus = body_json(app.clone().oneshot(request).await.unwrap().into_body()).await;
            if current.state == RunState::AwaitingDecision {
                status = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = status.expect("session never reached its gate");
        assert_eq!(status.pending_gate.unwrap().payload, json!({"summary": "X"}));
    }

    #[tokio::test]
    async fn test_start_session_rejects_empty_document() {
        let app = test_app(test_engine());
        let request = Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(json!({"input_document": "  "}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = test_app(test_engine());
        let request = Request::builder()
            .uri(format!("/api/sessions/{}", SessionId::new()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_decision_is_422_and_gate_stays_open() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        let (id, token) = suspended_session(&engine).await;

        let response = app
            .oneshot(decision(id, json!({"token": token, "decision": "revise"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "malformed_decision");

        let status = engine.get_status(id).await.unwrap();
        assert_eq!(status.pending_gate.unwrap().lock_token, token);
    }

    #[tokio::test]
    async fn test_stale_token_is_409() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        let (id, _) = suspended_session(&engine).await;

        let response = app
            .oneshot(decision(id, json!({"token": GateToken::new(), "decision": "approve"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "stale_token");
    }

    #[tokio::test]
    async fn test_abort_terminates_session() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        let (id, token) = suspended_session(&engine).await;

        let response = app
            .oneshot(decision(id, json!({"token": token, "decision": "abort"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: SessionStatus = body_json(response.into_body()).await;
        assert_eq!(status.state, RunState::Terminated);
        assert!(status.pending_gate.is_none());
    }

    #[tokio::test]
    async fn test_artifact_and_log() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        let (id, _) = suspended_session(&engine).await;

        let request = Request::builder()
            .uri(format!("/api/sessions/{}/artifacts/requirements", id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let artifact: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(artifact["content"], json!({"summary": "X"}));

        let request = Request::builder()
            .uri(format!("/api/sessions/{}/artifacts/design", id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri(format!("/api/sessions/{}/log", id))
            .body(Body::empty())
            .unwrap();
        let events: Vec<serde_json::Value> = body_json(app.oneshot(request).await.unwrap().into_body()).await;
        let kinds: Vec<&str> = events.iter().filter_map(|e| e["kind"].as_str()).collect();
        assert_eq!(kinds, vec!["session_started", "stage_started", "gate_opened"]);
    }

    fn resume(id: SessionId) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{}/resume", id))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_resume_restarts_a_stalled_session() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        // Never driven: running, but nothing is working on it.
        let id = engine.create_session("doc").await.unwrap().session_id;

        let response = app.oneshot(resume(id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut state = RunState::Running;
        for _ in 0..100 {
            state = engine.get_status(id).await.unwrap().state;
            if state != RunState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, RunState::AwaitingDecision);
    }

    #[tokio::test]
    async fn test_resume_of_ended_session_is_409() {
        let engine = test_engine();
        let app = test_app(engine.clone());
        let (id, token) = suspended_session(&engine).await;
        engine
            .submit_decision(id, token, &DecisionRequest::abort())
            .await
            .unwrap();

        let response = app.oneshot(resume(id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "session_closed");
    }

    #[tokio::test]
    async fn test_invalid_session_id_is_400() {
        let app = test_app(test_engine());
        let request = Request::builder()
            .uri("/api/sessions/not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
