//! Server-sent event stream of a session's progress.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::StreamExt;
use stagegate_common::PipelineEvent;

use super::api::{ApiError, SharedState};

/// Encode one pipeline event as an SSE frame named after its kind.
pub fn to_sse(event: &PipelineEvent) -> Event {
    let frame = Event::default()
        .event(event.kind.as_str())
        .id(event.seq.to_string());
    match frame.json_data(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(session = %event.session_id, error = %e, "failed to encode event");
            Event::default().comment("unencodable event")
        }
    }
}

pub async fn stream_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id '{}'", id)))?;
    let events = state.engine.stream_events(id).await?;
    let frames = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(frames).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Engine, EngineSettings};
    use crate::server::api::{AppState, api_router};
    use crate::store::{MemorySessionStore, SharedStore};
    use crate::worker::{RetryPolicy, ScriptedStageWorker, ScriptedSubtasks, SubtaskRegistry, Workers};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use stagegate_common::{DecisionRequest, SessionId};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn engine() -> Arc<Engine> {
        let store: SharedStore = Arc::new(MemorySessionStore::new());
        let workers = Workers::new(
            Arc::new(ScriptedStageWorker::new()),
            SubtaskRegistry::new(Arc::new(ScriptedSubtasks::new())),
        );
        Arc::new(Engine::new(
            store,
            workers,
            EngineSettings::default().with_retry_policy(RetryPolicy::immediate()),
        ))
    }

    #[tokio::test]
    async fn terminal_session_streams_snapshot_then_ends() {
        let engine = engine();
        let id = engine.create_session("doc").await.unwrap().session_id;
        let token = engine
            .drive(id)
            .await
            .unwrap()
            .pending_gate
            .unwrap()
            .lock_token;
        engine
            .submit_decision(id, token, &DecisionRequest::abort())
            .await
            .unwrap();

        let app = api_router().with_state(Arc::new(AppState { engine }));
        let request = Request::builder()
            .uri(format!("/api/sessions/{}/events", id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: snapshot"));
        assert!(text.contains("terminated"));
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let app = api_router().with_state(Arc::new(AppState { engine: engine() }));
        let request = Request::builder()
            .uri(format!("/api/sessions/{}/events", SessionId::new()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
