use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use docflow_api::{ApiState, router};
use docflow_engine::testing::{ScriptedAnalysis, ScriptedTasks, valid_request};
use docflow_engine::{EngineConfig, WorkflowEngine};
use docflow_store::{MemoryStore, Store};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app(analysis: ScriptedAnalysis) -> (Router, WorkflowEngine, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  let engine = WorkflowEngine::new(
    EngineConfig::default(),
    store.clone(),
    Arc::new(ScriptedTasks::succeeding()),
    Arc::new(analysis),
  );
  let app = router(ApiState {
    engine: engine.clone(),
  });
  (app, engine, store)
}

fn post_json(uri: &str, body: String) -> Request<Body> {
  Request::builder()
    .method("POST")
    .uri(uri)
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body))
    .unwrap()
}

fn get(uri: &str) -> Request<Body> {
  Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
  let (app, _, _) = app(ScriptedAnalysis::succeeding());

  let response = app.oneshot(get("/health")).await.unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  assert_eq!(&bytes[..], b"ok");
}

#[tokio::test(start_paused = true)]
async fn test_process_document_accepts_and_completes() {
  let (app, engine, _) = app(ScriptedAnalysis::succeeding());

  let response = app
    .clone()
    .oneshot(post_json("/process-document", valid_request().to_string()))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::ACCEPTED);

  let body = json_body(response).await;
  let execution_id = body["executionId"].as_str().unwrap().to_string();
  assert!(engine.wait(&execution_id).await.unwrap().is_success());

  let response = app
    .oneshot(get(&format!("/executions/{}", execution_id)))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    json_body(response).await,
    json!({ "executionId": execution_id, "status": "succeeded" })
  );
}

#[tokio::test]
async fn test_missing_field_is_bad_request() {
  let (app, _, store) = app(ScriptedAnalysis::succeeding());

  let mut payload = valid_request();
  payload.as_object_mut().unwrap().remove("file_name");

  let response = app
    .oneshot(post_json("/process-document", payload.to_string()))
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  let body = json_body(response).await;
  assert!(body["error"].as_str().unwrap().contains("file_name"));
  assert!(store.list_executions(None).await.unwrap().is_empty());
  assert!(store.list_dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
  let (app, _, _) = app(ScriptedAnalysis::succeeding());

  let response = app
    .oneshot(post_json("/process-document", "{not json".to_string()))
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
  let (app, _, _) = app(ScriptedAnalysis::succeeding());

  let response = app.oneshot(get("/executions/missing")).await.unwrap();

  assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_execution() {
  let (app, engine, _) = app(ScriptedAnalysis::never_finishing());

  let execution_id = engine.start(valid_request()).await.unwrap();

  let response = app
    .clone()
    .oneshot(post_json(
      &format!("/executions/{}/cancel", execution_id),
      String::new(),
    ))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::ACCEPTED);
  engine.wait(&execution_id).await.unwrap();

  let response = app
    .clone()
    .oneshot(get(&format!("/executions/{}", execution_id)))
    .await
    .unwrap();
  assert_eq!(
    json_body(response).await,
    json!({
      "executionId": execution_id,
      "status": "failed",
      "error": "execution cancelled"
    })
  );

  let response = app
    .oneshot(post_json(
      &format!("/executions/{}/cancel", execution_id),
      String::new(),
    ))
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::CONFLICT);
}
