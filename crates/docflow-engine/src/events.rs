//! Execution events and notifiers for observability.
//!
//! Events are emitted as an execution moves through its states so consumers
//! can persist, stream or alert on progress.

use std::sync::Arc;

use docflow_workflow::{FailureKind, State};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// An execution was accepted and recorded.
  WorkflowStarted {
    execution_id: String,
    document_id: String,
  },

  /// A previously persisted execution was picked up again.
  WorkflowResumed { execution_id: String, state: State },

  StateEntered { execution_id: String, state: State },

  StateCompleted {
    execution_id: String,
    state: State,
    next: State,
  },

  /// A task attempt failed transiently and will be retried after `delay_ms`.
  TaskRetrying {
    execution_id: String,
    state: State,
    attempt: u32,
    delay_ms: u64,
    error: String,
  },

  WorkflowSucceeded { execution_id: String },

  WorkflowFailed {
    execution_id: String,
    state: State,
    kind: FailureKind,
    error: String,
  },
}

impl ExecutionEvent {
  pub fn execution_id(&self) -> &str {
    match self {
      ExecutionEvent::WorkflowStarted { execution_id, .. }
      | ExecutionEvent::WorkflowResumed { execution_id, .. }
      | ExecutionEvent::StateEntered { execution_id, .. }
      | ExecutionEvent::StateCompleted { execution_id, .. }
      | ExecutionEvent::TaskRetrying { execution_id, .. }
      | ExecutionEvent::WorkflowSucceeded { execution_id }
      | ExecutionEvent::WorkflowFailed { execution_id, .. } => execution_id,
    }
  }
}

/// Trait for receiving execution events.
///
/// The engine calls `notify` for each event; implementations decide what to
/// do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded: `notify` is synchronous and must not block an execution.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Delivers every event to each of its notifiers in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
  notifiers: Vec<Arc<dyn ExecutionNotifier>>,
}

impl FanoutNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifiers.push(notifier);
    self
  }
}

impl ExecutionNotifier for FanoutNotifier {
  fn notify(&self, event: ExecutionEvent) {
    for notifier in &self.notifiers {
      notifier.notify(event.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fanout_delivers_to_every_notifier() {
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let fanout = FanoutNotifier::new()
      .with(Arc::new(ChannelNotifier::new(tx_a)))
      .with(Arc::new(NoopNotifier))
      .with(Arc::new(ChannelNotifier::new(tx_b)));

    fanout.notify(ExecutionEvent::WorkflowSucceeded {
      execution_id: "exec-1".to_string(),
    });

    assert_eq!(rx_a.try_recv().unwrap().execution_id(), "exec-1");
    assert_eq!(rx_b.try_recv().unwrap().execution_id(), "exec-1");
  }

  #[test]
  fn test_channel_notifier_survives_dropped_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    ChannelNotifier::new(tx).notify(ExecutionEvent::WorkflowSucceeded {
      execution_id: "exec-1".to_string(),
    });
  }
}
