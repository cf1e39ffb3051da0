use thiserror::Error;

use crate::state::State;

/// A start request that cannot become an execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
  #[error("request body must be a JSON object")]
  NotAnObject,

  #[error("missing required fields: {}", fields.join(", "))]
  MissingFields { fields: Vec<String> },

  #[error("malformed request: {message}")]
  Malformed { message: String },
}

/// Violations of the execution context's write-once discipline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
  #[error("context field '{key}' was already written")]
  AlreadyWritten { key: &'static str },

  #[error("context field '{key}' has not been written yet")]
  Missing { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
  #[error("state {state} branches on '{key}', which is missing from the context")]
  MissingField { state: State, key: &'static str },

  #[error("state {0} is terminal")]
  Terminal(State),
}
