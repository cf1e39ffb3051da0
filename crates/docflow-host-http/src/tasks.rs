use std::time::Duration;

use async_trait::async_trait;
use docflow_engine::{TaskError, TaskInvocation, TaskInvoker};
use tracing::{debug, instrument};

use crate::endpoint::Endpoint;
use crate::error::ClientError;

/// Invokes worker functions over HTTP.
///
/// Each invocation is `POST {base_url}/{task}` with the invocation as the
/// JSON body and its idempotency key in the `Idempotency-Key` header. The
/// worker's JSON response is returned as the task output.
#[derive(Debug, Clone)]
pub struct HttpTaskInvoker {
  endpoint: Endpoint,
}

impl HttpTaskInvoker {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
    Ok(Self {
      endpoint: Endpoint::new(base_url, timeout)?,
    })
  }
}

#[async_trait]
impl TaskInvoker for HttpTaskInvoker {
  #[instrument(
    name = "http_task_invoke",
    skip_all,
    fields(task = %invocation.task, attempt = invocation.attempt)
  )]
  async fn invoke(&self, invocation: TaskInvocation) -> Result<serde_json::Value, TaskError> {
    let url = self.endpoint.url(&[invocation.task.as_str()]);
    debug!(url = %url, idempotency_key = %invocation.idempotency_key, "task_request");

    let request = self
      .endpoint
      .client()
      .post(url)
      .header("Idempotency-Key", &invocation.idempotency_key)
      .json(&invocation);
    self.endpoint.send(request).await
  }
}
