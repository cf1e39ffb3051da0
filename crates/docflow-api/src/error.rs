use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docflow_engine::EngineError;
use serde_json::json;
use tracing::error;

/// An error answered as `{"error": message}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }
}

impl From<EngineError> for ApiError {
  fn from(err: EngineError) -> Self {
    let status = match &err {
      EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
      EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
      EngineError::NotRunning { .. } | EngineError::Claimed { .. } => StatusCode::CONFLICT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self::new(status, err.to_string())
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    if self.status.is_server_error() {
      error!(status = %self.status, error = %self.message, "request_failed");
    }
    (self.status, Json(json!({ "error": self.message }))).into_response()
  }
}
