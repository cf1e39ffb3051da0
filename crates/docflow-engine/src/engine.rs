//! The workflow engine: public operations over durable executions.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use docflow_config::AppConfig;
use docflow_store::{ExecutionRecord, Lease, Store};
use docflow_workflow::{
  ExecutionContext, ExecutionOutcome, ExecutionStatus, State, WorkflowRequest,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborator::{AnalysisService, TaskInvoker};
use crate::error::EngineError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::execution::Execution;
use crate::retry::RetryPolicy;

/// Configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
  /// Delay of the wait state between analysis status checks.
  pub poll_interval: Duration,
  /// Status checks allowed per execution. Unbounded when `None`.
  pub max_polls: Option<u32>,
  pub retry: RetryPolicy,
  pub analysis_output_bucket: String,
  /// Lease held on an execution between checkpoints.
  pub lease: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self::from_app(&AppConfig::default())
  }
}

impl EngineConfig {
  pub fn from_app(config: &AppConfig) -> Self {
    Self {
      poll_interval: config.poll_interval(),
      max_polls: config.max_polls,
      retry: RetryPolicy::from_config(&config.retry),
      analysis_output_bucket: config.analysis_output_bucket.clone(),
      lease: config.lease(),
    }
  }
}

struct ActiveExecution {
  cancel: CancellationToken,
  done: watch::Receiver<bool>,
}

pub(crate) struct EngineInner {
  /// Identifies this engine as the holder of execution leases.
  pub(crate) owner: String,
  pub(crate) config: EngineConfig,
  pub(crate) store: Arc<dyn Store>,
  pub(crate) tasks: Arc<dyn TaskInvoker>,
  pub(crate) analysis: Arc<dyn AnalysisService>,
  pub(crate) notifier: Arc<dyn ExecutionNotifier>,
  pub(crate) shutdown: CancellationToken,
  active: Mutex<HashMap<String, ActiveExecution>>,
}

impl EngineInner {
  fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveExecution>> {
    self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// A fresh lease for this engine, running from now.
  pub(crate) fn lease(&self) -> Lease {
    let now = Utc::now();
    let expires_at = chrono::Duration::from_std(self.config.lease)
      .ok()
      .and_then(|lease| now.checked_add_signed(lease))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Lease {
      owner: self.owner.clone(),
      expires_at,
    }
  }

  async fn release(&self, execution_id: &str) {
    if let Err(e) = self
      .store
      .release_execution(execution_id, &self.owner)
      .await
    {
      warn!(execution_id = %execution_id, error = %e, "lease_release_failed");
    }
  }
}

/// Marks an execution finished on this engine when its task ends, however
/// it ends.
struct Finished {
  inner: Arc<EngineInner>,
  execution_id: String,
  done: watch::Sender<bool>,
}

impl Drop for Finished {
  fn drop(&mut self) {
    self.inner.active().remove(&self.execution_id);
    let _ = self.done.send(true);
  }
}

/// The workflow engine.
///
/// Cheap to clone; clones share the same store, collaborators and set of
/// in-flight executions. Every execution runs as its own tokio task and is
/// checkpointed to the store after each state. An engine drives an execution
/// only while it holds the execution's lease, so any engine over the same
/// store can resume an execution once its previous owner let go or stopped
/// renewing.
#[derive(Clone)]
pub struct WorkflowEngine {
  inner: Arc<EngineInner>,
}

impl WorkflowEngine {
  /// Create a new engine that discards execution events.
  pub fn new(
    config: EngineConfig,
    store: Arc<dyn Store>,
    tasks: Arc<dyn TaskInvoker>,
    analysis: Arc<dyn AnalysisService>,
  ) -> Self {
    Self::with_notifier(config, store, tasks, analysis, Arc::new(NoopNotifier))
  }

  /// Create a new engine with a custom notifier.
  pub fn with_notifier(
    config: EngineConfig,
    store: Arc<dyn Store>,
    tasks: Arc<dyn TaskInvoker>,
    analysis: Arc<dyn AnalysisService>,
    notifier: Arc<dyn ExecutionNotifier>,
  ) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        owner: uuid::Uuid::new_v4().to_string(),
        config,
        store,
        tasks,
        analysis,
        notifier,
        shutdown: CancellationToken::new(),
        active: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.inner.store
  }

  /// The id this engine holds execution leases under.
  pub fn owner(&self) -> &str {
    &self.inner.owner
  }

  /// Validate `payload` and start an execution for it.
  ///
  /// Returns as soon as the execution is recorded; the states run on a
  /// spawned task. An invalid request fails before anything is written.
  pub async fn start(&self, payload: serde_json::Value) -> Result<String, EngineError> {
    let request = WorkflowRequest::from_json(&payload)?;
    let execution_id = uuid::Uuid::new_v4().to_string();
    let document_id = request.document_id.clone();
    let context = ExecutionContext::new(request);

    let record = ExecutionRecord::running(
      &execution_id,
      State::INITIAL.name(),
      payload,
      serde_json::to_value(&context)?,
      Utc::now(),
    )
    .owned_by(&self.inner.lease());
    self.inner.store.create_execution(&record).await?;

    info!(
      execution_id = %execution_id,
      document_id = %document_id,
      "workflow_started"
    );
    self.inner.notifier.notify(ExecutionEvent::WorkflowStarted {
      execution_id: execution_id.clone(),
      document_id,
    });

    self.spawn(Execution::new(
      self.inner.clone(),
      execution_id.clone(),
      State::INITIAL,
      context,
      0,
    ));
    Ok(execution_id)
  }

  pub async fn get_status(&self, execution_id: &str) -> Result<ExecutionStatus, EngineError> {
    let record = self.execution(execution_id).await?;
    Ok(status_of(&record))
  }

  /// The stored record of an execution.
  pub async fn execution(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
    self
      .inner
      .store
      .get_execution(execution_id)
      .await
      .map_err(|e| EngineError::from_lookup(execution_id, e))
  }

  /// Request cancellation.
  ///
  /// An in-flight execution stops at its next state boundary or during its
  /// polling wait and ends `Failed("execution cancelled")`. The request is
  /// recorded in the store, so an execution driven by another engine stops
  /// at that engine's next state boundary. An execution nobody holds is
  /// taken over here and failed straight away.
  pub async fn cancel(&self, execution_id: &str) -> Result<(), EngineError> {
    if let Some(active) = self.inner.active().get(execution_id) {
      info!(execution_id = %execution_id, "workflow_cancel_requested");
      active.cancel.cancel();
      return Ok(());
    }

    self
      .inner
      .store
      .request_cancel(execution_id)
      .await
      .map_err(|e| match e {
        docflow_store::Error::Conflict(_) => EngineError::NotRunning {
          execution_id: execution_id.to_string(),
        },
        other => EngineError::from_lookup(execution_id, other),
      })?;
    info!(execution_id = %execution_id, "workflow_cancel_requested");

    if let Some(execution) = self.claim(execution_id).await? {
      self.spawn(execution);
    }
    Ok(())
  }

  /// Re-drive a persisted `Running` execution from its checkpoint.
  ///
  /// Does nothing if the execution is already in flight on this engine.
  /// Fails with [`EngineError::Claimed`] while another engine holds it.
  pub async fn resume(&self, execution_id: &str) -> Result<(), EngineError> {
    if self.inner.active().contains_key(execution_id) {
      return Ok(());
    }

    let record = self.execution(execution_id).await?;
    if status_of(&record).is_terminal() {
      return Err(EngineError::NotRunning {
        execution_id: execution_id.to_string(),
      });
    }

    let Some(execution) = self.claim(execution_id).await? else {
      return Err(EngineError::Claimed {
        execution_id: execution_id.to_string(),
      });
    };

    let state = execution.state();
    if !self.spawn(execution) {
      return Ok(());
    }
    info!(execution_id = %execution_id, state = %state, "workflow_resumed");
    self.inner.notifier.notify(ExecutionEvent::WorkflowResumed {
      execution_id: execution_id.to_string(),
      state,
    });
    Ok(())
  }

  /// Resume every `Running` execution in the store. Returns their ids.
  pub async fn resume_incomplete(&self) -> Result<Vec<String>, EngineError> {
    let running = self
      .inner
      .store
      .list_executions(Some(docflow_store::ExecutionStatus::Running))
      .await?;

    let mut resumed = Vec::with_capacity(running.len());
    for record in running {
      match self.resume(&record.execution_id).await {
        Ok(()) => resumed.push(record.execution_id),
        Err(EngineError::Claimed { execution_id }) => {
          debug!(execution_id = %execution_id, "workflow_resume_skipped");
        }
        Err(e) => {
          error!(
            execution_id = %record.execution_id,
            error = %e,
            "workflow_resume_failed"
          );
        }
      }
    }
    Ok(resumed)
  }

  /// Wait for an execution to reach its terminal state.
  ///
  /// Fails with [`EngineError::Suspended`] if the execution is not in flight
  /// on this engine and has not completed.
  pub async fn wait(&self, execution_id: &str) -> Result<ExecutionOutcome, EngineError> {
    let done = self
      .inner
      .active()
      .get(execution_id)
      .map(|active| active.done.clone());

    if let Some(mut done) = done {
      // The sender is dropped only after the flag is set.
      let _ = done.wait_for(|done| *done).await;
    }

    let record = self.execution(execution_id).await?;
    match record.status {
      docflow_store::ExecutionStatus::Succeeded => {
        let context: ExecutionContext = serde_json::from_value(record.context.0)?;
        Ok(ExecutionOutcome::Success(
          context.processing_output().cloned().unwrap_or_default(),
        ))
      }
      docflow_store::ExecutionStatus::Failed => {
        Ok(ExecutionOutcome::Failed(record.error.unwrap_or_default()))
      }
      docflow_store::ExecutionStatus::Running => Err(EngineError::Suspended {
        execution_id: execution_id.to_string(),
      }),
    }
  }

  /// Number of executions currently in flight on this engine.
  pub fn active_count(&self) -> usize {
    self.inner.active().len()
  }

  /// Suspend every in-flight execution at its next state boundary.
  ///
  /// Suspended executions stay `Running` in the store, give up their lease
  /// and can be resumed by any engine.
  pub fn shutdown(&self) {
    info!(active = self.active_count(), "engine_shutdown");
    self.inner.shutdown.cancel();
  }

  /// Wait until no execution is in flight.
  pub async fn drained(&self) {
    let pending: Vec<watch::Receiver<bool>> = self
      .inner
      .active()
      .values()
      .map(|active| active.done.clone())
      .collect();
    for mut done in pending {
      let _ = done.wait_for(|done| *done).await;
    }
  }

  /// Take the lease of a running execution and restore it from its latest
  /// checkpoint. `None` if another engine holds it or it is no longer running.
  async fn claim(&self, execution_id: &str) -> Result<Option<Execution>, EngineError> {
    let claimed = self
      .inner
      .store
      .claim_execution(execution_id, &self.inner.lease(), Utc::now())
      .await?;
    if !claimed {
      return Ok(None);
    }

    let record = self.execution(execution_id).await?;
    self.restore(&record).map(Some)
  }

  fn restore(&self, record: &ExecutionRecord) -> Result<Execution, EngineError> {
    let checkpoint_error = |message: String| EngineError::Checkpoint {
      execution_id: record.execution_id.clone(),
      message,
    };

    let state = State::from_str(&record.current_state).map_err(checkpoint_error)?;
    let context: ExecutionContext = serde_json::from_value(record.context.0.clone())
      .map_err(|e| checkpoint_error(e.to_string()))?;
    let poll_count = u32::try_from(record.poll_count)
      .map_err(|_| checkpoint_error(format!("invalid poll count {}", record.poll_count)))?;

    Ok(Execution::new(
      self.inner.clone(),
      record.execution_id.clone(),
      state,
      context,
      poll_count,
    ))
  }

  /// Run `execution` on its own task. Returns false if it is already in
  /// flight on this engine.
  fn spawn(&self, execution: Execution) -> bool {
    let execution_id = execution.id().to_string();
    let (done_tx, done_rx) = watch::channel(false);
    {
      let mut active = self.inner.active();
      if active.contains_key(&execution_id) {
        return false;
      }
      active.insert(
        execution_id.clone(),
        ActiveExecution {
          cancel: execution.cancel_token(),
          done: done_rx,
        },
      );
    }

    let finished = Finished {
      inner: self.inner.clone(),
      execution_id,
      done: done_tx,
    };
    tokio::spawn(async move {
      let inner = &finished.inner;
      let execution_id = finished.execution_id.as_str();
      match execution.run().await {
        Ok(Some(_)) => {}
        Ok(None) => inner.release(execution_id).await,
        Err(e) => {
          error!(
            execution_id = %execution_id,
            error = %e,
            "workflow_suspended_on_error"
          );
          inner.release(execution_id).await;
        }
      }
    });
    true
  }
}

fn status_of(record: &ExecutionRecord) -> ExecutionStatus {
  match record.status {
    docflow_store::ExecutionStatus::Running => ExecutionStatus::Running,
    docflow_store::ExecutionStatus::Succeeded => ExecutionStatus::Succeeded,
    docflow_store::ExecutionStatus::Failed => {
      ExecutionStatus::Failed(record.error.clone().unwrap_or_default())
    }
  }
}
