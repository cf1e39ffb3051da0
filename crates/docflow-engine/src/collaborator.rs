//! Interfaces to the external collaborators the engine drives.
//!
//! The engine only sees these traits. HTTP implementations live in
//! `docflow-host-http`; scripted fakes in [`crate::testing`].

use std::fmt;

use async_trait::async_trait;
use docflow_workflow::{AnalysisStatus, DocumentRef};
use serde::{Deserialize, Serialize};

/// The worker functions invoked as task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskName {
  StartWorkflow,
  Extraction,
  Processing,
  Notify,
}

impl TaskName {
  /// Path segment used to address the worker.
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskName::StartWorkflow => "start-workflow",
      TaskName::Extraction => "extraction",
      TaskName::Processing => "processing",
      TaskName::Notify => "notify",
    }
  }
}

impl fmt::Display for TaskName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A single attempt at a worker call. Serializes to the request body sent to
/// the worker; the task itself is addressed separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInvocation {
  #[serde(skip)]
  pub task: TaskName,
  pub execution_id: String,
  /// Stable across retries and re-deliveries of the same state.
  pub idempotency_key: String,
  /// 1-based attempt number.
  pub attempt: u32,
  pub input: serde_json::Value,
}

/// How a collaborator call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
  /// A service fault worth retrying (throttling, 5xx, connection loss).
  #[error("transient service fault: {message}")]
  Transient { message: String },

  /// The collaborator rejected the work. Never retried.
  #[error("{message}")]
  Logic { message: String },
}

impl TaskError {
  pub fn transient(message: impl Into<String>) -> Self {
    TaskError::Transient {
      message: message.into(),
    }
  }

  pub fn logic(message: impl Into<String>) -> Self {
    TaskError::Logic {
      message: message.into(),
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, TaskError::Transient { .. })
  }
}

/// Invokes the worker functions.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
  async fn invoke(&self, invocation: TaskInvocation) -> Result<serde_json::Value, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Object {
  #[serde(rename = "Bucket")]
  pub bucket: String,
  #[serde(rename = "Name")]
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLocation {
  #[serde(rename = "S3Object")]
  pub s3_object: S3Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
  #[serde(rename = "S3Bucket")]
  pub s3_bucket: String,
  #[serde(rename = "S3Prefix")]
  pub s3_prefix: String,
}

/// Request to start an asynchronous document analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
  #[serde(rename = "DocumentLocation")]
  pub document_location: DocumentLocation,
  #[serde(rename = "FeatureTypes")]
  pub feature_types: Vec<String>,
  #[serde(rename = "OutputConfig")]
  pub output_config: OutputConfig,
}

impl AnalysisRequest {
  /// Table analysis of `document`, with results written under
  /// `textract-output/{file_name}` in `output_bucket`.
  pub fn for_document(document: &DocumentRef, output_bucket: &str) -> Self {
    Self {
      document_location: DocumentLocation {
        s3_object: S3Object {
          bucket: document.bucket_name.clone(),
          name: document.file_name.clone(),
        },
      },
      feature_types: vec!["TABLES".to_string()],
      output_config: OutputConfig {
        s3_bucket: output_bucket.to_string(),
        s3_prefix: format!("textract-output/{}", document.file_name),
      },
    }
  }
}

/// The asynchronous document-analysis service.
#[async_trait]
pub trait AnalysisService: Send + Sync {
  /// Start a job and return its id.
  async fn start_analysis(&self, request: &AnalysisRequest) -> Result<String, TaskError>;

  async fn get_analysis_status(&self, job_id: &str) -> Result<AnalysisStatus, TaskError>;
}
