use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Running,
  Succeeded,
  Failed,
}

impl ExecutionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ExecutionStatus::Running => "running",
      ExecutionStatus::Succeeded => "succeeded",
      ExecutionStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A workflow execution as stored in the database.
///
/// `context` and `current_state` form the checkpoint an execution resumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
  pub execution_id: String,
  pub status: ExecutionStatus,
  pub current_state: String,
  pub request: Json<serde_json::Value>,
  pub context: Json<serde_json::Value>,
  pub poll_count: i64,
  pub error: Option<String>,
  /// Worker currently driving the execution, if any.
  pub owner: Option<String>,
  pub lease_expires_at: Option<DateTime<Utc>>,
  /// Set by a cancel request; the owner observes it at its next state boundary.
  pub cancel_requested: bool,
  pub started_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
  /// A freshly started execution positioned at `initial_state`.
  pub fn running(
    execution_id: impl Into<String>,
    initial_state: impl Into<String>,
    request: serde_json::Value,
    context: serde_json::Value,
    started_at: DateTime<Utc>,
  ) -> Self {
    Self {
      execution_id: execution_id.into(),
      status: ExecutionStatus::Running,
      current_state: initial_state.into(),
      request: Json(request),
      context: Json(context),
      poll_count: 0,
      error: None,
      owner: None,
      lease_expires_at: None,
      cancel_requested: false,
      started_at,
      updated_at: started_at,
      completed_at: None,
    }
  }

  /// The same record, held under `lease`.
  pub fn owned_by(mut self, lease: &Lease) -> Self {
    self.owner = Some(lease.owner.clone());
    self.lease_expires_at = Some(lease.expires_at);
    self
  }
}

/// The exclusive right of one worker to drive an execution.
///
/// Renewed by every checkpoint. Once `expires_at` passes without renewal,
/// another worker may claim the execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
  pub owner: String,
  pub expires_at: DateTime<Utc>,
}

/// The mutable part of an execution, written after every state.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
  pub current_state: String,
  pub context: serde_json::Value,
  pub poll_count: i64,
}

/// The durable record of one state's work within an execution.
///
/// Keyed by `(execution_id, state)`; writing the same key again replaces the
/// record instead of adding another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
  pub execution_id: String,
  pub state: String,
  pub attempts: i32,
  pub output: Option<Json<serde_json::Value>>,
  pub error: Option<String>,
  pub completed_at: DateTime<Utc>,
}

/// A start request that could not become an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
  pub id: String,
  pub payload: Json<serde_json::Value>,
  pub reason: String,
  pub received_at: DateTime<Utc>,
}
