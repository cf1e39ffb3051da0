use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible status of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ExecutionStatus {
  Running,
  Succeeded,
  Failed(String),
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, ExecutionStatus::Running)
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExecutionStatus::Running => f.write_str("running"),
      ExecutionStatus::Succeeded => f.write_str("succeeded"),
      ExecutionStatus::Failed(reason) => write!(f, "failed: {}", reason),
    }
  }
}

/// The single terminal outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
  /// Carries the processing task's output.
  Success(serde_json::Value),
  Failed(String),
}

impl ExecutionOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, ExecutionOutcome::Success(_))
  }

  pub fn status(&self) -> ExecutionStatus {
    match self {
      ExecutionOutcome::Success(_) => ExecutionStatus::Succeeded,
      ExecutionOutcome::Failed(reason) => ExecutionStatus::Failed(reason.clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_wire_format() {
    assert_eq!(
      serde_json::to_value(ExecutionStatus::Running).unwrap(),
      json!({ "status": "running" })
    );
    assert_eq!(
      serde_json::to_value(ExecutionStatus::Failed("boom".to_string())).unwrap(),
      json!({ "status": "failed", "reason": "boom" })
    );
  }

  #[test]
  fn test_outcome_maps_to_status() {
    let outcome = ExecutionOutcome::Success(json!({ "statusCode": 200 }));
    assert!(outcome.is_success());
    assert_eq!(outcome.status(), ExecutionStatus::Succeeded);
    assert!(outcome.status().is_terminal());

    let failed = ExecutionOutcome::Failed("execution cancelled".to_string());
    assert_eq!(
      failed.status().to_string(),
      "failed: execution cancelled"
    );
  }
}
