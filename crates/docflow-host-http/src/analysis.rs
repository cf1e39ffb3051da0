use std::time::Duration;

use async_trait::async_trait;
use docflow_engine::{AnalysisRequest, AnalysisService, TaskError};
use docflow_workflow::AnalysisStatus;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::endpoint::Endpoint;
use crate::error::ClientError;

#[derive(Debug, Deserialize)]
struct StartResponse {
  #[serde(rename = "JobId")]
  job_id: String,
}

/// Talks to the document-analysis service over HTTP.
///
/// `POST {base_url}/analysis` starts a job and answers `{"JobId"}`;
/// `GET {base_url}/analysis/{job_id}` reports `{"JobStatus", "ResultsLocation"?}`.
#[derive(Debug, Clone)]
pub struct HttpAnalysisService {
  endpoint: Endpoint,
}

impl HttpAnalysisService {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
    Ok(Self {
      endpoint: Endpoint::new(base_url, timeout)?,
    })
  }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
  #[instrument(name = "http_analysis_start", skip_all)]
  async fn start_analysis(&self, request: &AnalysisRequest) -> Result<String, TaskError> {
    let url = self.endpoint.url(&["analysis"]);
    let response: StartResponse = self
      .endpoint
      .send(self.endpoint.client().post(url).json(request))
      .await?;

    if response.job_id.is_empty() {
      return Err(TaskError::logic("analysis service returned an empty JobId"));
    }
    debug!(job_id = %response.job_id, "analysis_job_created");
    Ok(response.job_id)
  }

  #[instrument(name = "http_analysis_status", skip(self))]
  async fn get_analysis_status(&self, job_id: &str) -> Result<AnalysisStatus, TaskError> {
    let url = self.endpoint.url(&["analysis", job_id]);
    self.endpoint.send(self.endpoint.client().get(url)).await
  }
}
