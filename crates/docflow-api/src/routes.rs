use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use docflow_engine::{EngineError, WorkflowEngine};
use docflow_workflow::ExecutionStatus;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
  pub engine: WorkflowEngine,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
  pub execution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
  pub execution_id: String,
  /// `running`, `succeeded` or `failed`.
  pub status: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl StatusResponse {
  fn new(execution_id: String, status: ExecutionStatus) -> Self {
    let (status, error) = match status {
      ExecutionStatus::Running => ("running", None),
      ExecutionStatus::Succeeded => ("succeeded", None),
      ExecutionStatus::Failed(reason) => ("failed", Some(reason)),
    };
    Self {
      execution_id,
      status,
      error,
    }
  }
}

pub fn router(state: ApiState) -> Router {
  Router::new()
    .route("/process-document", post(process_document))
    .route("/executions/{id}", get(execution_status))
    .route("/executions/{id}/cancel", post(cancel_execution))
    .route("/health", get(health))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn health() -> &'static str {
  "ok"
}

/// Start an execution. A request the engine cannot record is kept as a
/// dead letter so it can be redriven.
async fn process_document(
  State(state): State<ApiState>,
  payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
  let Json(payload) =
    payload.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

  match state.engine.start(payload.clone()).await {
    Ok(execution_id) => {
      info!(execution_id = %execution_id, "process_document_accepted");
      Ok((StatusCode::ACCEPTED, Json(StartResponse { execution_id })))
    }
    Err(err @ EngineError::InvalidRequest(_)) => Err(err.into()),
    Err(err) => {
      docflow_engine::dead_letter(&state.engine, payload, &err).await?;
      Err(err.into())
    }
  }
}

async fn execution_status(
  State(state): State<ApiState>,
  Path(execution_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
  let status = state.engine.get_status(&execution_id).await?;
  Ok(Json(StatusResponse::new(execution_id, status)))
}

async fn cancel_execution(
  State(state): State<ApiState>,
  Path(execution_id): Path<String>,
) -> Result<StatusCode, ApiError> {
  state.engine.cancel(&execution_id).await?;
  Ok(StatusCode::ACCEPTED)
}
