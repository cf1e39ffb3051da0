use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of an asynchronous document-analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  InProgress,
  Succeeded,
  Failed,
  /// Reported by the analysis service for partially processed documents.
  /// Branching treats it like any other non-terminal status.
  PartialSuccess,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::InProgress => "IN_PROGRESS",
      JobStatus::Succeeded => "SUCCEEDED",
      JobStatus::Failed => "FAILED",
      JobStatus::PartialSuccess => "PARTIAL_SUCCESS",
    }
  }

  /// Whether polling can stop.
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Succeeded | JobStatus::Failed)
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "IN_PROGRESS" => Ok(JobStatus::InProgress),
      "SUCCEEDED" => Ok(JobStatus::Succeeded),
      "FAILED" => Ok(JobStatus::Failed),
      "PARTIAL_SUCCESS" => Ok(JobStatus::PartialSuccess),
      other => Err(format!("unknown job status '{}'", other)),
    }
  }
}

/// Where the analysis service writes its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsLocation {
  pub bucket: String,
  pub prefix: String,
}

/// One status report for an analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStatus {
  #[serde(rename = "JobStatus")]
  pub status: JobStatus,
  #[serde(rename = "ResultsLocation", skip_serializing_if = "Option::is_none")]
  pub results: Option<ResultsLocation>,
}

impl AnalysisStatus {
  pub fn new(status: JobStatus) -> Self {
    Self {
      status,
      results: None,
    }
  }
}

/// An analysis job as seen by the workflow: its id and latest known status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
  #[serde(rename = "jobId")]
  pub job_id: String,
  pub status: JobStatus,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_wire_format() {
    let status: AnalysisStatus = serde_json::from_value(json!({ "JobStatus": "IN_PROGRESS" })).unwrap();
    assert_eq!(status, AnalysisStatus::new(JobStatus::InProgress));

    let value = serde_json::to_value(AnalysisStatus::new(JobStatus::PartialSuccess)).unwrap();
    assert_eq!(value, json!({ "JobStatus": "PARTIAL_SUCCESS" }));
  }

  #[test]
  fn test_terminal_statuses() {
    assert!(JobStatus::Succeeded.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(!JobStatus::InProgress.is_terminal());
    assert!(!JobStatus::PartialSuccess.is_terminal());
  }

  #[test]
  fn test_parse_rejects_unknown() {
    assert_eq!("SUCCEEDED".parse::<JobStatus>(), Ok(JobStatus::Succeeded));
    assert!("DONE".parse::<JobStatus>().is_err());
  }
}
