//! Engine errors.

use docflow_workflow::RequestError;

/// Errors returned by the engine's public operations.
///
/// Failures inside a running execution are not errors here: they route the
/// execution to its `Failed` terminal and are recorded on the execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// The start request is missing fields or is malformed. Nothing was recorded.
  #[error("invalid request: {0}")]
  InvalidRequest(#[from] RequestError),

  #[error("execution '{execution_id}' not found")]
  NotFound { execution_id: String },

  #[error("execution '{execution_id}' is not running")]
  NotRunning { execution_id: String },

  /// Another worker holds a live lease on the execution.
  #[error("execution '{execution_id}' is held by another worker")]
  Claimed { execution_id: String },

  /// The execution stopped without reaching a terminal state, either on
  /// shutdown or after a storage failure. It can be resumed.
  #[error("execution '{execution_id}' was suspended before completing")]
  Suspended { execution_id: String },

  #[error("corrupt checkpoint for execution '{execution_id}': {message}")]
  Checkpoint {
    execution_id: String,
    message: String,
  },

  #[error("workflow runner channel closed")]
  ChannelClosed,

  #[error("store error: {0}")]
  Store(#[from] docflow_store::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl EngineError {
  /// Map a store lookup failure, turning a missing record into `NotFound`.
  pub(crate) fn from_lookup(execution_id: &str, err: docflow_store::Error) -> Self {
    match err {
      docflow_store::Error::NotFound(_) => EngineError::NotFound {
        execution_id: execution_id.to_string(),
      },
      other => EngineError::Store(other),
    }
  }
}
