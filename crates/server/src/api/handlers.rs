use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dagrun_core::config::TimeConfig;
use dagrun_core::runner::InstanceSummary;
use dagrun_core::{DagDefinition, InstanceId, RunnerId, TaskId, TaskRecord, WorkflowState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SubmitWorkflowRequest {
    pub definition: DagDefinition,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitWorkflowResponse {
    pub id: InstanceId,
}

/// Validate a definition and create a new instance in `created`
pub async fn submit_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<SubmitWorkflowResponse>)> {
    let id = state
        .runner
        .submit(request.definition, request.input)
        .await?;
    Ok((StatusCode::CREATED, Json(SubmitWorkflowResponse { id })))
}

/// Instance summary with timestamps rendered in the configured offset
#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub id: InstanceId,
    pub name: String,
    pub state: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_holder: Option<RunnerId>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkflowSummary {
    fn render(summary: InstanceSummary, time: &TimeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            created_at: time.render(summary.created_at)?,
            updated_at: time.render(summary.updated_at)?,
            id: summary.id,
            name: summary.name,
            state: summary.state,
            last_error: summary.last_error,
            lease_holder: summary.lease_holder,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
}

/// List every known instance
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state
        .runner
        .list()
        .await?
        .into_iter()
        .map(|summary| WorkflowSummary::render(summary, &state.time))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub summary: WorkflowSummary,
    pub input: serde_json::Value,
    pub tasks: Vec<TaskRecord>,
}

/// Best-known state of one instance and its task nodes
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDetail>> {
    let view = state.runner.get(parse_id(&id)?).await?;
    Ok(Json(WorkflowDetail {
        summary: WorkflowSummary::render(view.summary, &state.time)?,
        input: view.input,
        tasks: view.tasks,
    }))
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub id: InstanceId,
    pub requested: String,
}

fn accepted(id: InstanceId, requested: &str) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id,
            requested: requested.to_string(),
        }),
    )
}

/// Request a cooperative stop
pub async fn stop_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let id = parse_id(&id)?;
    state.runner.stop(id).await?;
    Ok(accepted(id, "stop"))
}

/// Request a forcible abort
pub async fn abort_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let id = parse_id(&id)?;
    state.runner.abort(id).await?;
    Ok(accepted(id, "abort"))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub task: Option<TaskId>,
}

/// Publish a named signal to a live instance
pub async fn send_signal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SignalRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let id = parse_id(&id)?;
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Signal name must not be empty"));
    }
    state
        .runner
        .signal(id, &request.name, request.payload, request.task)
        .await?;
    Ok(accepted(id, &request.name))
}

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    InstanceId::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid workflow ID: {}", raw)))
}
