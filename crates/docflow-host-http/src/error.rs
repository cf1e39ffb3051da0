use docflow_engine::TaskError;
use reqwest::StatusCode;

/// Errors building an HTTP collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("invalid base url '{url}': {source}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("base url '{0}' cannot carry a path")]
  NotABase(String),

  #[error("failed to build http client: {0}")]
  Build(#[from] reqwest::Error),
}

/// Classify a failed request. Anything that never produced a response is
/// worth retrying.
pub(crate) fn from_transport(err: reqwest::Error) -> TaskError {
  if err.is_decode() {
    return TaskError::logic(format!("invalid response body: {}", err));
  }
  TaskError::transient(err.to_string())
}

/// Classify a non-success response: throttling, timeouts and 5xx are
/// transient, every other status is a logic failure.
pub(crate) fn from_status(status: StatusCode, body: &str) -> TaskError {
  let message = if body.is_empty() {
    format!("status {}", status)
  } else {
    format!("status {}: {}", status, body)
  };

  if status.is_server_error()
    || status == StatusCode::TOO_MANY_REQUESTS
    || status == StatusCode::REQUEST_TIMEOUT
  {
    TaskError::transient(message)
  } else {
    TaskError::logic(message)
  }
}
