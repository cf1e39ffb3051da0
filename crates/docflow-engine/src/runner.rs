//! Workflow runner with channel-based triggering.
//!
//! The `WorkflowRunner` owns an mpsc channel for receiving start requests
//! and starts an execution on the `WorkflowEngine` for each one. Requests
//! that cannot be started are kept as dead letters.

use chrono::Utc;
use docflow_store::{DeadLetter, Json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::WorkflowEngine;
use crate::error::EngineError;

/// A runner that starts executions in response to raw start requests.
///
/// # Usage
///
/// ```ignore
/// let runner = WorkflowRunner::new(engine);
///
/// // Get sender for external triggers (HTTP handlers, queues, etc.)
/// let sender = runner.sender();
///
/// // Start the intake loop
/// let cancel = CancellationToken::new();
/// runner.start(cancel).await?;
/// ```
pub struct WorkflowRunner {
  sender: mpsc::Sender<serde_json::Value>,
  receiver: mpsc::Receiver<serde_json::Value>,
  engine: WorkflowEngine,
}

impl WorkflowRunner {
  pub fn new(engine: WorkflowEngine) -> Self {
    Self::with_buffer_size(engine, 100)
  }

  /// Create a new workflow runner with a custom buffer size.
  pub fn with_buffer_size(engine: WorkflowEngine, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));
    Self {
      sender,
      receiver,
      engine,
    }
  }

  /// Get a sender handle for submitting start requests.
  pub fn sender(&self) -> mpsc::Sender<serde_json::Value> {
    self.sender.clone()
  }

  /// Submit a start request through the channel.
  pub async fn run(&self, payload: serde_json::Value) -> Result<(), EngineError> {
    self
      .sender
      .send(payload)
      .await
      .map_err(|_| EngineError::ChannelClosed)
  }

  pub fn engine(&self) -> &WorkflowEngine {
    &self.engine
  }

  /// Start the intake loop.
  ///
  /// Runs until the cancellation token is triggered or every sender is
  /// dropped. Executions already started keep running on the engine.
  pub async fn start(mut self, cancel: CancellationToken) -> Result<(), EngineError> {
    info!("workflow_runner_started");

    // The runner's own sender would keep the channel open forever.
    drop(self.sender);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("workflow_runner_cancelled");
          break;
        }
        payload = self.receiver.recv() => {
          match payload {
            Some(payload) => {
              accept(&self.engine, payload).await?;
            }
            None => {
              info!("workflow_runner_channel_closed");
              break;
            }
          }
        }
      }
    }

    Ok(())
  }
}

/// Start an execution for `payload`, dead-lettering it if it is rejected.
///
/// Only a failure to write the dead letter itself is returned.
pub async fn accept(
  engine: &WorkflowEngine,
  payload: serde_json::Value,
) -> Result<Option<String>, EngineError> {
  match engine.start(payload.clone()).await {
    Ok(execution_id) => Ok(Some(execution_id)),
    Err(e) => {
      dead_letter(engine, payload, &e).await?;
      Ok(None)
    }
  }
}

/// Keep a start request that `err` prevented from starting. Returns the id
/// of the dead letter.
pub async fn dead_letter(
  engine: &WorkflowEngine,
  payload: serde_json::Value,
  err: &EngineError,
) -> Result<String, EngineError> {
  let letter = DeadLetter {
    id: uuid::Uuid::new_v4().to_string(),
    payload: Json(payload),
    reason: err.to_string(),
    received_at: Utc::now(),
  };
  warn!(
    dead_letter_id = %letter.id,
    reason = %letter.reason,
    "start_request_dead_lettered"
  );
  engine.store().push_dead_letter(&letter).await?;
  Ok(letter.id)
}

/// Result of re-submitting the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedriveReport {
  /// Executions started, one per removed dead letter.
  pub started: Vec<String>,
  /// Dead letters that were rejected again and stay queued.
  pub remaining: usize,
}

/// Re-submit every dead letter, removing those that start successfully.
pub async fn redrive(engine: &WorkflowEngine) -> Result<RedriveReport, EngineError> {
  let letters = engine.store().list_dead_letters().await?;
  let mut report = RedriveReport::default();

  for letter in letters {
    match engine.start(letter.payload.0.clone()).await {
      Ok(execution_id) => {
        engine.store().remove_dead_letter(&letter.id).await?;
        info!(
          dead_letter_id = %letter.id,
          execution_id = %execution_id,
          "dead_letter_redriven"
        );
        report.started.push(execution_id);
      }
      Err(e) => {
        error!(
          dead_letter_id = %letter.id,
          error = %e,
          "dead_letter_rejected"
        );
        report.remaining += 1;
      }
    }
  }

  Ok(report)
}
