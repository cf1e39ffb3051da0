//! The execution context threaded through every state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::job::{AnalysisJob, AnalysisStatus, JobStatus};
use crate::request::{DocumentRef, WorkflowRequest};
use crate::state::State;

/// Why an execution ended in the `Failed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// A service fault that persisted through every retry attempt.
  TransientServiceFault,
  /// A non-retriable failure reported by a task or a failed analysis job.
  TaskLogicFailure,
  /// The analysis job was still running when the poll ceiling was reached.
  PollTimeout,
  Cancelled,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FailureKind::TransientServiceFault => "transient service fault",
      FailureKind::TaskLogicFailure => "task logic failure",
      FailureKind::PollTimeout => "poll timeout",
      FailureKind::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// The error recorded in the context when an execution fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
  pub state: State,
  pub kind: FailureKind,
  pub message: String,
}

impl ExecutionError {
  pub fn new(state: State, kind: FailureKind, message: impl Into<String>) -> Self {
    Self {
      state,
      kind,
      message: message.into(),
    }
  }

  pub fn cancelled(state: State) -> Self {
    Self::new(state, FailureKind::Cancelled, "execution cancelled")
  }
}

impl fmt::Display for ExecutionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} in {}: {}", self.kind, self.state, self.message)
  }
}

/// The shape handed to the processing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
  #[serde(rename = "textractJobId")]
  pub textract_job_id: String,
  #[serde(rename = "documentType")]
  pub document_type: String,
  #[serde(rename = "documentId")]
  pub document_id: String,
  #[serde(rename = "fileInfoId")]
  pub file_info_id: String,
  pub bucket_name: String,
  pub file_name: String,
}

/// Append-only record of everything an execution has produced so far.
///
/// Each key is owned by exactly one state and written once. The analysis
/// status is the exception: the check state rewrites it on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
  request: WorkflowRequest,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  start_workflow_result: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  body: Option<DocumentRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  textract_job_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  textract_job_status: Option<AnalysisStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  processing_result: Option<ProcessingResult>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  processing_output: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  status_code: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  error: Option<ExecutionError>,
}

fn write_once<T>(slot: &mut Option<T>, key: &'static str, value: T) -> Result<(), ContextError> {
  if slot.is_some() {
    return Err(ContextError::AlreadyWritten { key });
  }
  *slot = Some(value);
  Ok(())
}

impl ExecutionContext {
  pub fn new(request: WorkflowRequest) -> Self {
    Self {
      request,
      start_workflow_result: None,
      body: None,
      textract_job_id: None,
      textract_job_status: None,
      processing_result: None,
      processing_output: None,
      status_code: None,
      error: None,
    }
  }

  pub fn request(&self) -> &WorkflowRequest {
    &self.request
  }

  pub fn start_workflow_result(&self) -> Option<&serde_json::Value> {
    self.start_workflow_result.as_ref()
  }

  /// The extraction payload, once the extraction step has run.
  pub fn document(&self) -> Option<&DocumentRef> {
    self.body.as_ref()
  }

  pub fn job_id(&self) -> Option<&str> {
    self.textract_job_id.as_deref()
  }

  pub fn job_status(&self) -> Option<&AnalysisStatus> {
    self.textract_job_status.as_ref()
  }

  /// The analysis job, if one was started. Its status is `IN_PROGRESS` until
  /// the first check reports otherwise.
  pub fn analysis_job(&self) -> Option<AnalysisJob> {
    let job_id = self.textract_job_id.clone()?;
    let status = self
      .textract_job_status
      .as_ref()
      .map(|s| s.status)
      .unwrap_or(JobStatus::InProgress);
    Some(AnalysisJob { job_id, status })
  }

  pub fn processing_result(&self) -> Option<&ProcessingResult> {
    self.processing_result.as_ref()
  }

  pub fn processing_output(&self) -> Option<&serde_json::Value> {
    self.processing_output.as_ref()
  }

  pub fn status_code(&self) -> Option<u16> {
    self.status_code
  }

  pub fn error(&self) -> Option<&ExecutionError> {
    self.error.as_ref()
  }

  pub fn record_start_result(&mut self, result: serde_json::Value) -> Result<(), ContextError> {
    write_once(&mut self.start_workflow_result, "startWorkflowResult", result)
  }

  pub fn record_extraction(&mut self, document: DocumentRef) -> Result<(), ContextError> {
    write_once(&mut self.body, "body", document)
  }

  pub fn record_job_id(&mut self, job_id: String) -> Result<(), ContextError> {
    write_once(&mut self.textract_job_id, "textractJobId", job_id)
  }

  /// Record the latest poll result, replacing the previous one.
  pub fn record_job_status(&mut self, status: AnalysisStatus) {
    self.textract_job_status = Some(status);
  }

  pub fn record_processing_result(&mut self, result: ProcessingResult) -> Result<(), ContextError> {
    write_once(&mut self.processing_result, "processingResult", result)
  }

  pub fn record_processing_output(
    &mut self,
    output: serde_json::Value,
  ) -> Result<(), ContextError> {
    write_once(&mut self.processing_output, "processingOutput", output)
  }

  pub fn record_status_code(&mut self, status_code: u16) -> Result<(), ContextError> {
    write_once(&mut self.status_code, "statusCode", status_code)
  }

  pub fn record_error(&mut self, error: ExecutionError) -> Result<(), ContextError> {
    write_once(&mut self.error, "error", error)
  }

  /// Build the processing result from the job id and the extraction payload.
  pub fn prepare_result(&self) -> Result<ProcessingResult, ContextError> {
    let job_id = self
      .textract_job_id
      .as_ref()
      .ok_or(ContextError::Missing {
        key: "textractJobId",
      })?;
    let document = self.body.as_ref().ok_or(ContextError::Missing { key: "body" })?;

    Ok(ProcessingResult {
      textract_job_id: job_id.clone(),
      document_type: document.document_type.clone(),
      document_id: document.document_id.clone(),
      file_info_id: document.file_info_id.clone(),
      bucket_name: document.bucket_name.clone(),
      file_name: document.file_name.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn request() -> WorkflowRequest {
    WorkflowRequest {
      document_id: "doc-1".to_string(),
      file_info_id: "file-1".to_string(),
      document_type: "Provider".to_string(),
      bucket_name: "raw-staging".to_string(),
      file_name: "file-1.pdf".to_string(),
    }
  }

  #[test]
  fn test_fields_are_write_once() {
    let mut ctx = ExecutionContext::new(request());
    ctx.record_start_result(json!({ "statusCode": 200 })).unwrap();

    let err = ctx.record_start_result(json!({})).unwrap_err();
    assert_eq!(
      err,
      ContextError::AlreadyWritten {
        key: "startWorkflowResult"
      }
    );
    assert_eq!(ctx.start_workflow_result(), Some(&json!({ "statusCode": 200 })));
  }

  #[test]
  fn test_job_status_is_rewritten_per_poll() {
    let mut ctx = ExecutionContext::new(request());
    ctx.record_job_id("job-1".to_string()).unwrap();
    assert_eq!(ctx.analysis_job().unwrap().status, JobStatus::InProgress);

    ctx.record_job_status(AnalysisStatus::new(JobStatus::InProgress));
    ctx.record_job_status(AnalysisStatus::new(JobStatus::Succeeded));

    let job = ctx.analysis_job().unwrap();
    assert_eq!(job.job_id, "job-1");
    assert_eq!(job.status, JobStatus::Succeeded);
  }

  #[test]
  fn test_prepare_result_reads_extraction_payload() {
    let mut ctx = ExecutionContext::new(request());
    assert_eq!(
      ctx.prepare_result().unwrap_err(),
      ContextError::Missing {
        key: "textractJobId"
      }
    );

    ctx.record_job_id("job-1".to_string()).unwrap();
    ctx.record_extraction(request().document()).unwrap();

    let result = ctx.prepare_result().unwrap();
    assert_eq!(result.textract_job_id, "job-1");
    assert_eq!(result.document_id, "doc-1");
    assert_eq!(result.file_info_id, "file-1");
    assert_eq!(result.file_name, "file-1.pdf");
  }

  #[test]
  fn test_serializes_with_wire_keys() {
    let mut ctx = ExecutionContext::new(request());
    ctx.record_job_id("job-1".to_string()).unwrap();
    ctx.record_job_status(AnalysisStatus::new(JobStatus::Failed));

    let value = serde_json::to_value(&ctx).unwrap();
    assert_eq!(value["textractJobId"], "job-1");
    assert_eq!(value["textractJobStatus"]["JobStatus"], "FAILED");
    assert_eq!(value["request"]["file_name"], "file-1.pdf");
    assert!(value.get("processingResult").is_none());

    let restored: ExecutionContext = serde_json::from_value(value).unwrap();
    assert_eq!(restored, ctx);
  }

  #[test]
  fn test_error_display() {
    let err = ExecutionError::new(State::ProcessDocument, FailureKind::TaskLogicFailure, "boom");
    assert_eq!(err.to_string(), "task logic failure in ProcessDocument: boom");
  }
}
