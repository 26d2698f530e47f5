use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dagrun_core::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Serve the API until ctrl-c or `cancel` fires
pub async fn serve(addr: &str, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::submit_workflow),
        )
        .route("/api/workflows/{id}", get(handlers::get_workflow))
        .route("/api/workflows/{id}/stop", post(handlers::stop_workflow))
        .route("/api/workflows/{id}/abort", post(handlers::abort_workflow))
        .route("/api/workflows/{id}/signals", post(handlers::send_signal))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dagrun",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error returned by handlers, rendered with a status derived from the cause
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

fn status_for(error: &anyhow::Error) -> StatusCode {
    match error.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(OrchestratorError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Some(e) if e.is_construction_error() => StatusCode::BAD_REQUEST,
        Some(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dagrun_core::{
        InstanceStore, ManualDispatcher, MemorySignalChannel, MemoryStateStore,
        OrchestratorConfig, RetryPolicy, RunnerId, SystemClock, WorkflowRunner,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let config = OrchestratorConfig::default();
        let records = InstanceStore::new(Arc::new(MemoryStateStore::new()), RetryPolicy::none());
        let runner = WorkflowRunner::new(
            RunnerId::new("api-test"),
            &config,
            records,
            Arc::new(MemorySignalChannel::new()),
            Arc::new(ManualDispatcher::new()),
            Arc::new(SystemClock),
        );
        create_router(AppState {
            runner,
            time: config.time,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn diamond() -> Value {
        json!({
            "definition": {
                "name": "diamond",
                "tasks": [
                    {"id": "a"},
                    {"id": "b", "predecessors": ["a"]},
                    {"id": "c", "predecessors": ["a"]},
                    {"id": "d", "predecessors": ["b", "c"]}
                ]
            },
            "input": {"day": "2026-10-17"}
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_then_get_and_list() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/workflows", Some(diamond())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", &format!("/api/workflows/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "created");
        assert_eq!(body["tasks"].as_array().unwrap().len(), 4);
        assert_eq!(body["input"]["day"], "2026-10-17");

        let (status, body) = call(&app, "GET", "/api/workflows", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workflows"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cyclic_definition_is_bad_request() {
        let body = json!({
            "definition": {
                "name": "loop",
                "tasks": [
                    {"id": "a", "predecessors": ["b"]},
                    {"id": "b", "predecessors": ["a"]}
                ]
            }
        });
        let (status, body) = call(&app(), "POST", "/api/workflows", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let app = app();
        let missing = format!("/api/workflows/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&app, "GET", &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/workflows/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_abort_created_then_conflict() {
        let app = app();
        let (_, body) = call(&app, "POST", "/api/workflows", Some(diamond())).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "POST", &format!("/api/workflows/{}/abort", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, body) = call(&app, "GET", &format!("/api/workflows/{}", id), None).await;
        assert_eq!(body["state"], "aborted");

        let (status, body) = call(&app, "POST", &format!("/api/workflows/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("aborted"));

        let signal = json!({"name": "refresh"});
        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/workflows/{}/signals", id),
            Some(signal),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
