use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::RwLock;

use crate::{
  Checkpoint, DeadLetter, Error, ExecutionRecord, ExecutionStatus, Lease, StepRecord, Store,
};

#[derive(Debug, Default)]
struct Inner {
  executions: HashMap<String, ExecutionRecord>,
  steps: HashMap<(String, String), StepRecord>,
  dead_letters: Vec<DeadLetter>,
}

/// In-memory store implementation.
///
/// Suitable for tests and ephemeral runs; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  inner: RwLock<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn not_found(execution_id: &str) -> Error {
  Error::NotFound(format!("execution '{}'", execution_id))
}

impl Inner {
  /// The running execution `execution_id`, if `owner` holds it (or, without
  /// an owner, whoever holds it).
  fn running_mut(
    &mut self,
    execution_id: &str,
    owner: Option<&str>,
  ) -> Result<&mut ExecutionRecord, Error> {
    let record = self
      .executions
      .get_mut(execution_id)
      .ok_or_else(|| not_found(execution_id))?;
    if record.status != ExecutionStatus::Running {
      return Err(Error::Conflict(format!(
        "execution '{}' is already {}",
        execution_id, record.status
      )));
    }
    if let Some(owner) = owner
      && record.owner.as_deref() != Some(owner)
    {
      return Err(Error::Conflict(format!(
        "execution '{}' is held by another worker",
        execution_id
      )));
    }
    Ok(record)
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    inner
      .executions
      .insert(execution.execution_id.clone(), execution.clone());
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    let inner = self.inner.read().await;
    inner
      .executions
      .get(execution_id)
      .cloned()
      .ok_or_else(|| not_found(execution_id))
  }

  async fn claim_execution(
    &self,
    execution_id: &str,
    lease: &Lease,
    now: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let mut inner = self.inner.write().await;
    let Some(record) = inner.executions.get_mut(execution_id) else {
      return Ok(false);
    };

    let claimable = record.status == ExecutionStatus::Running
      && (record.owner.is_none()
        || record.owner.as_deref() == Some(lease.owner.as_str())
        || record.lease_expires_at.is_none_or(|expires| expires < now));
    if claimable {
      record.owner = Some(lease.owner.clone());
      record.lease_expires_at = Some(lease.expires_at);
    }
    Ok(claimable)
  }

  async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    if let Ok(record) = inner.running_mut(execution_id, Some(owner)) {
      record.owner = None;
      record.lease_expires_at = None;
    }
    Ok(())
  }

  async fn save_checkpoint(
    &self,
    execution_id: &str,
    lease: &Lease,
    checkpoint: &Checkpoint,
  ) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let record = inner.running_mut(execution_id, Some(&lease.owner))?;
    record.current_state = checkpoint.current_state.clone();
    record.context = Json(checkpoint.context.clone());
    record.poll_count = checkpoint.poll_count;
    record.lease_expires_at = Some(lease.expires_at);
    record.updated_at = Utc::now();
    Ok(())
  }

  async fn complete_execution(
    &self,
    execution_id: &str,
    owner: &str,
    status: ExecutionStatus,
    checkpoint: &Checkpoint,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
  ) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let record = inner.running_mut(execution_id, Some(owner))?;
    record.status = status;
    record.current_state = checkpoint.current_state.clone();
    record.context = Json(checkpoint.context.clone());
    record.poll_count = checkpoint.poll_count;
    record.error = error.map(str::to_string);
    record.owner = None;
    record.lease_expires_at = None;
    record.updated_at = completed_at;
    record.completed_at = Some(completed_at);
    Ok(())
  }

  async fn request_cancel(&self, execution_id: &str) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let record = inner.running_mut(execution_id, None)?;
    record.cancel_requested = true;
    record.updated_at = Utc::now();
    Ok(())
  }

  async fn cancel_requested(&self, execution_id: &str) -> Result<bool, Error> {
    let inner = self.inner.read().await;
    inner
      .executions
      .get(execution_id)
      .map(|record| record.cancel_requested)
      .ok_or_else(|| not_found(execution_id))
  }

  async fn list_executions(
    &self,
    status: Option<ExecutionStatus>,
  ) -> Result<Vec<ExecutionRecord>, Error> {
    let inner = self.inner.read().await;
    let mut records: Vec<ExecutionRecord> = inner
      .executions
      .values()
      .filter(|record| status.is_none_or(|s| record.status == s))
      .cloned()
      .collect();
    records.sort_by_key(|record| record.started_at);
    Ok(records)
  }

  async fn upsert_step(&self, step: &StepRecord) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    inner.steps.insert(
      (step.execution_id.clone(), step.state.clone()),
      step.clone(),
    );
    Ok(())
  }

  async fn get_step(&self, execution_id: &str, state: &str) -> Result<Option<StepRecord>, Error> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .steps
        .get(&(execution_id.to_string(), state.to_string()))
        .cloned(),
    )
  }

  async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, Error> {
    let inner = self.inner.read().await;
    let mut steps: Vec<StepRecord> = inner
      .steps
      .values()
      .filter(|step| step.execution_id == execution_id)
      .cloned()
      .collect();
    steps.sort_by_key(|step| step.completed_at);
    Ok(steps)
  }

  async fn push_dead_letter(&self, letter: &DeadLetter) -> Result<(), Error> {
    self.inner.write().await.dead_letters.push(letter.clone());
    Ok(())
  }

  async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
    Ok(self.inner.read().await.dead_letters.clone())
  }

  async fn remove_dead_letter(&self, id: &str) -> Result<(), Error> {
    let mut inner = self.inner.write().await;
    let before = inner.dead_letters.len();
    inner.dead_letters.retain(|letter| letter.id != id);
    if inner.dead_letters.len() == before {
      return Err(Error::NotFound(format!("dead letter '{}'", id)));
    }
    Ok(())
  }
}
