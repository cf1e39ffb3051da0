//! Scripted collaborators for exercising the engine without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use docflow_workflow::{AnalysisStatus, JobStatus, ResultsLocation};
use serde_json::{Value, json};

use crate::collaborator::{
  AnalysisRequest, AnalysisService, TaskError, TaskInvocation, TaskInvoker, TaskName,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A start request with every required field.
pub fn valid_request() -> Value {
  json!({
    "documentId": "doc-1",
    "fileInfoId": "file-1",
    "documentType": "Provider",
    "bucket_name": "raw-staging",
    "file_name": "file-1.pdf"
  })
}

/// What a healthy worker answers for `invocation`.
///
/// Extraction echoes the request back as its body, processing reports where
/// it wrote its output and notify acknowledges with 200.
pub fn healthy_response(invocation: &TaskInvocation) -> Value {
  match invocation.task {
    TaskName::StartWorkflow => json!({ "statusCode": 200, "body": "" }),
    TaskName::Extraction => json!({ "statusCode": 200, "body": invocation.input }),
    TaskName::Processing => {
      let result = &invocation.input["processingResult"];
      let file_name = result["file_name"].as_str().unwrap_or_default();
      json!({
        "statusCode": 200,
        "body": "{\"message\": \"Medical document processed successfully\"}",
        "outputS3BucketName": "processed-output",
        "outputS3Key": format!("processed/{}.json", file_name),
        "documentId": result["documentId"],
        "fileInfoId": result["fileInfoId"]
      })
    }
    TaskName::Notify => json!({
      "statusCode": 200,
      "body": "{\"message\": \"Processing completed successfully\"}"
    }),
  }
}

/// A [`TaskInvoker`] that answers like healthy workers unless scripted
/// otherwise, and records every invocation it receives.
#[derive(Default)]
pub struct ScriptedTasks {
  responses: Mutex<HashMap<TaskName, Value>>,
  failures: Mutex<HashMap<TaskName, VecDeque<TaskError>>>,
  invocations: Mutex<Vec<TaskInvocation>>,
}

impl ScriptedTasks {
  pub fn succeeding() -> Self {
    Self::default()
  }

  /// Answer every invocation of `task` with `response`.
  pub fn with_response(self, task: TaskName, response: Value) -> Self {
    lock(&self.responses).insert(task, response);
    self
  }

  /// Fail the next invocations of `task` with `errors`, in order.
  pub fn with_failures(self, task: TaskName, errors: Vec<TaskError>) -> Self {
    lock(&self.failures)
      .entry(task)
      .or_default()
      .extend(errors);
    self
  }

  pub fn invocations(&self) -> Vec<TaskInvocation> {
    lock(&self.invocations).clone()
  }

  /// Number of invocations of `task`, including failed attempts.
  pub fn calls(&self, task: TaskName) -> usize {
    lock(&self.invocations)
      .iter()
      .filter(|invocation| invocation.task == task)
      .count()
  }
}

#[async_trait]
impl TaskInvoker for ScriptedTasks {
  async fn invoke(&self, invocation: TaskInvocation) -> Result<Value, TaskError> {
    lock(&self.invocations).push(invocation.clone());

    if let Some(error) = lock(&self.failures)
      .get_mut(&invocation.task)
      .and_then(VecDeque::pop_front)
    {
      return Err(error);
    }

    let scripted = lock(&self.responses).get(&invocation.task).cloned();
    Ok(scripted.unwrap_or_else(|| healthy_response(&invocation)))
  }
}

/// An [`AnalysisService`] that reports a scripted sequence of job statuses.
///
/// Once the script runs out the last status repeats.
pub struct ScriptedAnalysis {
  job_id: String,
  statuses: Mutex<VecDeque<JobStatus>>,
  last: JobStatus,
  start_failures: Mutex<VecDeque<TaskError>>,
  status_failures: Mutex<VecDeque<TaskError>>,
  requests: Mutex<Vec<AnalysisRequest>>,
  checks: Mutex<usize>,
}

impl ScriptedAnalysis {
  pub fn with_statuses(statuses: Vec<JobStatus>) -> Self {
    let last = statuses.last().copied().unwrap_or(JobStatus::Succeeded);
    Self {
      job_id: "job-1".to_string(),
      statuses: Mutex::new(statuses.into()),
      last,
      start_failures: Mutex::new(VecDeque::new()),
      status_failures: Mutex::new(VecDeque::new()),
      requests: Mutex::new(Vec::new()),
      checks: Mutex::new(0),
    }
  }

  /// A job that has finished by the first status check.
  pub fn succeeding() -> Self {
    Self::with_statuses(vec![JobStatus::Succeeded])
  }

  /// A job that stays `IN_PROGRESS` forever.
  pub fn never_finishing() -> Self {
    Self::with_statuses(vec![JobStatus::InProgress])
  }

  pub fn with_start_failures(self, errors: Vec<TaskError>) -> Self {
    lock(&self.start_failures).extend(errors);
    self
  }

  pub fn with_status_failures(self, errors: Vec<TaskError>) -> Self {
    lock(&self.status_failures).extend(errors);
    self
  }

  pub fn job_id(&self) -> &str {
    &self.job_id
  }

  /// Every start request received, including failed attempts.
  pub fn requests(&self) -> Vec<AnalysisRequest> {
    lock(&self.requests).clone()
  }

  /// Number of status checks answered, including failed attempts.
  pub fn checks(&self) -> usize {
    *lock(&self.checks)
  }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
  async fn start_analysis(&self, request: &AnalysisRequest) -> Result<String, TaskError> {
    lock(&self.requests).push(request.clone());
    if let Some(error) = lock(&self.start_failures).pop_front() {
      return Err(error);
    }
    Ok(self.job_id.clone())
  }

  async fn get_analysis_status(&self, job_id: &str) -> Result<AnalysisStatus, TaskError> {
    *lock(&self.checks) += 1;
    if let Some(error) = lock(&self.status_failures).pop_front() {
      return Err(error);
    }
    if job_id != self.job_id {
      return Err(TaskError::logic(format!("unknown job '{}'", job_id)));
    }

    let status = match lock(&self.statuses).pop_front() {
      Some(status) => status,
      None => self.last,
    };

    let mut report = AnalysisStatus::new(status);
    if status == JobStatus::Succeeded {
      report.results = Some(ResultsLocation {
        bucket: "textract-output".to_string(),
        prefix: format!("textract-output/{}", self.job_id),
      });
    }
    Ok(report)
  }
}
