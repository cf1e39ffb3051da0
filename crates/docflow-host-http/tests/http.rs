use std::time::Duration;

use docflow_engine::{
  AnalysisRequest, AnalysisService, TaskError, TaskInvocation, TaskInvoker, TaskName,
};
use docflow_host_http::{HttpAnalysisService, HttpTaskInvoker};
use docflow_workflow::{DocumentRef, JobStatus};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn invocation(task: TaskName) -> TaskInvocation {
  TaskInvocation {
    task,
    execution_id: "exec-1".to_string(),
    idempotency_key: format!("exec-1:{}", task),
    attempt: 1,
    input: json!({ "documentId": "doc-1" }),
  }
}

fn document() -> DocumentRef {
  DocumentRef {
    document_id: "doc-1".to_string(),
    file_info_id: "file-1".to_string(),
    document_type: "Provider".to_string(),
    bucket_name: "raw-staging".to_string(),
    file_name: "file-1.pdf".to_string(),
  }
}

#[tokio::test]
async fn test_invoke_posts_to_task_path() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/extraction"))
    .and(header("idempotency-key", "exec-1:extraction"))
    .and(body_json(json!({
      "executionId": "exec-1",
      "idempotencyKey": "exec-1:extraction",
      "attempt": 1,
      "input": { "documentId": "doc-1" }
    })))
    .respond_with(
      ResponseTemplate::new(200).set_body_json(json!({ "statusCode": 200, "body": {} })),
    )
    .expect(1)
    .mount(&server)
    .await;

  let invoker = HttpTaskInvoker::new(&server.uri(), TIMEOUT).unwrap();
  let output = invoker.invoke(invocation(TaskName::Extraction)).await.unwrap();

  assert_eq!(output["statusCode"], 200);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/processing"))
    .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
    .mount(&server)
    .await;

  let invoker = HttpTaskInvoker::new(&server.uri(), TIMEOUT).unwrap();
  let err = invoker
    .invoke(invocation(TaskName::Processing))
    .await
    .unwrap_err();

  assert!(err.is_transient());
  assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn test_client_errors_are_logic_failures() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/notify"))
    .respond_with(ResponseTemplate::new(400).set_body_string("missing documentId"))
    .mount(&server)
    .await;

  let invoker = HttpTaskInvoker::new(&server.uri(), TIMEOUT).unwrap();
  let err = invoker.invoke(invocation(TaskName::Notify)).await.unwrap_err();

  assert_eq!(
    err,
    TaskError::logic("status 400 Bad Request: missing documentId")
  );
}

#[tokio::test]
async fn test_undecodable_body_is_a_logic_failure() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/start-workflow"))
    .respond_with(ResponseTemplate::new(200).set_body_string("<soap:Envelope/>"))
    .mount(&server)
    .await;

  let invoker = HttpTaskInvoker::new(&server.uri(), TIMEOUT).unwrap();
  let err = invoker
    .invoke(invocation(TaskName::StartWorkflow))
    .await
    .unwrap_err();

  assert!(!err.is_transient());
}

#[tokio::test]
async fn test_unreachable_worker_is_transient() {
  let server = MockServer::start().await;
  let uri = server.uri();
  drop(server);

  let invoker = HttpTaskInvoker::new(&uri, TIMEOUT).unwrap();
  let err = invoker
    .invoke(invocation(TaskName::Extraction))
    .await
    .unwrap_err();

  assert!(err.is_transient());
}

#[tokio::test]
async fn test_start_analysis() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/analysis"))
    .and(body_json(json!({
      "DocumentLocation": { "S3Object": { "Bucket": "raw-staging", "Name": "file-1.pdf" } },
      "FeatureTypes": ["TABLES"],
      "OutputConfig": { "S3Bucket": "textract-output", "S3Prefix": "textract-output/file-1.pdf" }
    })))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "JobId": "job-1" })))
    .expect(1)
    .mount(&server)
    .await;

  let service = HttpAnalysisService::new(&server.uri(), TIMEOUT).unwrap();
  let request = AnalysisRequest::for_document(&document(), "textract-output");

  assert_eq!(service.start_analysis(&request).await.unwrap(), "job-1");
}

#[tokio::test]
async fn test_get_analysis_status() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/analysis/job-1"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "JobStatus": "SUCCEEDED",
      "ResultsLocation": { "bucket": "textract-output", "prefix": "textract-output/file-1.pdf" }
    })))
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/analysis/job-2"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "JobStatus": "IN_PROGRESS" })))
    .mount(&server)
    .await;

  let service = HttpAnalysisService::new(&server.uri(), TIMEOUT).unwrap();

  let done = service.get_analysis_status("job-1").await.unwrap();
  assert_eq!(done.status, JobStatus::Succeeded);
  assert_eq!(done.results.unwrap().prefix, "textract-output/file-1.pdf");

  let pending = service.get_analysis_status("job-2").await.unwrap();
  assert_eq!(pending.status, JobStatus::InProgress);
  assert!(pending.results.is_none());
}

#[tokio::test]
async fn test_throttled_status_check_is_transient() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/analysis/job-1"))
    .respond_with(ResponseTemplate::new(429))
    .mount(&server)
    .await;

  let service = HttpAnalysisService::new(&server.uri(), TIMEOUT).unwrap();
  let err = service.get_analysis_status("job-1").await.unwrap_err();

  assert!(err.is_transient());
}
