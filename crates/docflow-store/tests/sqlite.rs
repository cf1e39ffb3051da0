use chrono::{Duration, Utc};
use docflow_store::{
  Checkpoint, DeadLetter, Error, ExecutionRecord, ExecutionStatus, Lease, SqliteStore, StepRecord,
  Store,
};
use serde_json::json;
use sqlx::types::Json;

fn lease(owner: &str) -> Lease {
  Lease {
    owner: owner.to_string(),
    expires_at: Utc::now() + Duration::minutes(5),
  }
}

fn record(id: &str) -> ExecutionRecord {
  ExecutionRecord::running(
    id,
    "StartWorkflow",
    json!({ "documentId": "doc-1", "file_name": "doc-1.pdf" }),
    json!({ "request": { "documentId": "doc-1", "file_name": "doc-1.pdf" } }),
    Utc::now(),
  )
  .owned_by(&lease("worker-a"))
}

fn checkpoint(state: &str) -> Checkpoint {
  Checkpoint {
    current_state: state.to_string(),
    context: json!({}),
    poll_count: 0,
  }
}

fn step(execution_id: &str, state: &str, attempts: i32) -> StepRecord {
  StepRecord {
    execution_id: execution_id.to_string(),
    state: state.to_string(),
    attempts,
    output: Some(Json(json!({ "statusCode": 200 }))),
    error: None,
    completed_at: Utc::now(),
  }
}

#[tokio::test]
async fn test_execution_lifecycle() {
  let store = SqliteStore::in_memory().await.unwrap();
  store.create_execution(&record("exec-1")).await.unwrap();

  let checkpoint = Checkpoint {
    current_state: "WaitForAnalysis".to_string(),
    context: json!({ "textractJobId": "job-1" }),
    poll_count: 1,
  };
  store
    .save_checkpoint("exec-1", &lease("worker-a"), &checkpoint)
    .await
    .unwrap();

  let loaded = store.get_execution("exec-1").await.unwrap();
  assert_eq!(loaded.status, ExecutionStatus::Running);
  assert_eq!(loaded.current_state, "WaitForAnalysis");
  assert_eq!(loaded.context.0["textractJobId"], "job-1");
  assert_eq!(loaded.poll_count, 1);
  assert_eq!(loaded.owner.as_deref(), Some("worker-a"));

  let done = Checkpoint {
    current_state: "Failed".to_string(),
    context: json!({ "textractJobId": "job-1", "error": { "message": "boom" } }),
    poll_count: 1,
  };
  store
    .complete_execution(
      "exec-1",
      "worker-a",
      ExecutionStatus::Failed,
      &done,
      Some("boom"),
      Utc::now(),
    )
    .await
    .unwrap();

  let loaded = store.get_execution("exec-1").await.unwrap();
  assert_eq!(loaded.status, ExecutionStatus::Failed);
  assert_eq!(loaded.error.as_deref(), Some("boom"));
  assert!(loaded.completed_at.is_some());
  assert_eq!(loaded.owner, None);
}

#[tokio::test]
async fn test_get_unknown_execution() {
  let store = SqliteStore::in_memory().await.unwrap();
  let err = store.get_execution("nope").await.unwrap_err();
  assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_step_upsert_keeps_one_record() {
  let store = SqliteStore::in_memory().await.unwrap();
  store.create_execution(&record("exec-1")).await.unwrap();

  store
    .upsert_step(&step("exec-1", "ProcessDocument", 1))
    .await
    .unwrap();
  store
    .upsert_step(&step("exec-1", "ProcessDocument", 2))
    .await
    .unwrap();

  let steps = store.list_steps("exec-1").await.unwrap();
  assert_eq!(steps.len(), 1);
  assert_eq!(steps[0].attempts, 2);

  let found = store
    .get_step("exec-1", "ProcessDocument")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(found.output, Some(Json(json!({ "statusCode": 200 }))));
  assert!(store.get_step("exec-1", "Notify").await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_running_executions() {
  let store = SqliteStore::in_memory().await.unwrap();
  let mut older = record("older");
  older.started_at = Utc::now() - Duration::minutes(5);
  older.updated_at = older.started_at;
  store.create_execution(&record("newer")).await.unwrap();
  store.create_execution(&older).await.unwrap();
  store.create_execution(&record("done")).await.unwrap();

  store
    .complete_execution(
      "done",
      "worker-a",
      ExecutionStatus::Succeeded,
      &checkpoint("Succeeded"),
      None,
      Utc::now(),
    )
    .await
    .unwrap();

  let running: Vec<String> = store
    .list_executions(Some(ExecutionStatus::Running))
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.execution_id)
    .collect();
  assert_eq!(running, vec!["older".to_string(), "newer".to_string()]);
}

#[tokio::test]
async fn test_dead_letters() {
  let store = SqliteStore::in_memory().await.unwrap();
  let letter = DeadLetter {
    id: "dl-1".to_string(),
    payload: Json(json!({ "documentId": "doc-1" })),
    reason: "missing required fields: file_name".to_string(),
    received_at: Utc::now(),
  };
  store.push_dead_letter(&letter).await.unwrap();

  let letters = store.list_dead_letters().await.unwrap();
  assert_eq!(letters.len(), 1);
  assert_eq!(letters[0].reason, letter.reason);

  store.remove_dead_letter("dl-1").await.unwrap();
  assert!(store.list_dead_letters().await.unwrap().is_empty());
  assert!(matches!(
    store.remove_dead_letter("dl-1").await,
    Err(Error::NotFound(_))
  ));
}

#[tokio::test]
async fn test_terminal_status_is_written_once() {
  let store = SqliteStore::in_memory().await.unwrap();
  store.create_execution(&record("exec-1")).await.unwrap();

  store
    .complete_execution(
      "exec-1",
      "worker-a",
      ExecutionStatus::Failed,
      &checkpoint("Failed"),
      Some("execution cancelled"),
      Utc::now(),
    )
    .await
    .unwrap();

  let err = store
    .complete_execution(
      "exec-1",
      "worker-a",
      ExecutionStatus::Succeeded,
      &checkpoint("Succeeded"),
      None,
      Utc::now(),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));
  assert!(matches!(
    store
      .save_checkpoint("exec-1", &lease("worker-a"), &checkpoint("Notify"))
      .await,
    Err(Error::Conflict(_))
  ));

  let loaded = store.get_execution("exec-1").await.unwrap();
  assert_eq!(loaded.status, ExecutionStatus::Failed);
  assert_eq!(loaded.current_state, "Failed");
  assert_eq!(loaded.error.as_deref(), Some("execution cancelled"));
}

#[tokio::test]
async fn test_claim_respects_live_lease() {
  let store = SqliteStore::in_memory().await.unwrap();
  store.create_execution(&record("exec-1")).await.unwrap();

  let now = Utc::now();
  assert!(
    !store
      .claim_execution("exec-1", &lease("worker-b"), now)
      .await
      .unwrap()
  );
  assert!(matches!(
    store
      .complete_execution(
        "exec-1",
        "worker-b",
        ExecutionStatus::Succeeded,
        &checkpoint("Succeeded"),
        None,
        now,
      )
      .await,
    Err(Error::Conflict(_))
  ));

  let expired = now + Duration::minutes(10);
  assert!(
    store
      .claim_execution("exec-1", &lease("worker-b"), expired)
      .await
      .unwrap()
  );
  assert_eq!(
    store.get_execution("exec-1").await.unwrap().owner.as_deref(),
    Some("worker-b")
  );

  store.release_execution("exec-1", "worker-b").await.unwrap();
  assert!(
    store
      .claim_execution("exec-1", &lease("worker-a"), now)
      .await
      .unwrap()
  );
}

#[tokio::test]
async fn test_cancel_request_is_durable() {
  let store = SqliteStore::in_memory().await.unwrap();
  store.create_execution(&record("exec-1")).await.unwrap();

  assert!(!store.cancel_requested("exec-1").await.unwrap());
  store.request_cancel("exec-1").await.unwrap();
  assert!(store.cancel_requested("exec-1").await.unwrap());

  assert!(matches!(
    store.request_cancel("missing").await,
    Err(Error::NotFound(_))
  ));
  assert!(matches!(
    store.cancel_requested("missing").await,
    Err(Error::NotFound(_))
  ));
}
