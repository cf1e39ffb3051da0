//! Error-count alarm over failed executions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use docflow_config::AlarmConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::events::{ExecutionEvent, ExecutionNotifier};

/// Published to the alert topic when the alarm fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
  /// Failures counted inside the window when the alarm fired.
  pub failures: usize,
  pub window_secs: u64,
  /// The failure that tripped the alarm.
  pub execution_id: String,
  pub error: String,
}

#[derive(Debug, Default)]
struct AlarmState {
  failures: VecDeque<Instant>,
  firing: bool,
}

/// Counts `WorkflowFailed` events in a rolling window.
///
/// Fires once when the count reaches `threshold`, then stays quiet until the
/// window has emptied, at which point it re-arms.
#[derive(Debug)]
pub struct ErrorAlarm {
  threshold: usize,
  window: Duration,
  state: Mutex<AlarmState>,
  alerts: mpsc::UnboundedSender<Alert>,
}

impl ErrorAlarm {
  pub fn new(threshold: u32, window: Duration, alerts: mpsc::UnboundedSender<Alert>) -> Self {
    Self {
      threshold: threshold.max(1) as usize,
      window,
      state: Mutex::new(AlarmState::default()),
      alerts,
    }
  }

  pub fn from_config(config: &AlarmConfig, alerts: mpsc::UnboundedSender<Alert>) -> Self {
    Self::new(config.threshold, config.window(), alerts)
  }

  /// Whether the alarm has fired and not yet re-armed.
  pub fn is_firing(&self) -> bool {
    let mut state = self.lock();
    self.expire(&mut state, Instant::now());
    state.firing
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, AlarmState> {
    // A poisoned lock only means another notifier call panicked; the counts
    // are still usable.
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn expire(&self, state: &mut AlarmState, now: Instant) {
    while let Some(oldest) = state.failures.front() {
      if now.duration_since(*oldest) >= self.window {
        state.failures.pop_front();
      } else {
        break;
      }
    }
    if state.failures.is_empty() {
      state.firing = false;
    }
  }

  fn record_failure(&self, execution_id: &str, error: &str) {
    let now = Instant::now();
    let mut state = self.lock();
    self.expire(&mut state, now);
    state.failures.push_back(now);

    if state.firing || state.failures.len() < self.threshold {
      return;
    }
    state.firing = true;

    let alert = Alert {
      failures: state.failures.len(),
      window_secs: self.window.as_secs(),
      execution_id: execution_id.to_string(),
      error: error.to_string(),
    };
    warn!(
      failures = alert.failures,
      window_secs = alert.window_secs,
      execution_id = %alert.execution_id,
      "error_alarm_fired"
    );
    let _ = self.alerts.send(alert);
  }
}

impl ExecutionNotifier for ErrorAlarm {
  fn notify(&self, event: ExecutionEvent) {
    if let ExecutionEvent::WorkflowFailed {
      execution_id,
      error,
      ..
    } = &event
    {
      self.record_failure(execution_id, error);
    }
  }
}
