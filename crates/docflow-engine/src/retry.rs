//! Exponential-backoff retry for collaborator calls.

use std::future::Future;
use std::time::Duration;

use docflow_config::RetryConfig;
use tokio_util::sync::CancellationToken;

use crate::collaborator::TaskError;

/// Retry policy applied to every task invocation.
///
/// Only [`TaskError::Transient`] failures are retried. The delay before
/// attempt `n + 1` is `interval * backoff_rate^(n - 1)`, capped at
/// `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub interval: Duration,
  pub backoff_rate: f64,
  pub max_interval: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default())
  }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
  Succeeded { value: T, attempts: u32 },
  /// A logic failure, or a transient one that outlived every attempt.
  Failed { error: TaskError, attempts: u32 },
  /// Cancellation fired while waiting between attempts.
  Interrupted,
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      interval: config.interval(),
      backoff_rate: config.backoff_rate,
      max_interval: config.max_interval(),
    }
  }

  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      interval: Duration::ZERO,
      backoff_rate: 1.0,
      max_interval: Duration::ZERO,
    }
  }

  /// Delay after the `attempt`-th failed attempt (1-based).
  ///
  /// Any delay that is not representable (overflow, a non-finite rate) is
  /// clamped to `max_interval`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = self.interval.as_secs_f64() * self.backoff_rate.powi(exponent);
    Duration::try_from_secs_f64(secs)
      .unwrap_or(self.max_interval)
      .min(self.max_interval)
  }

  /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
  ///
  /// `op` receives the 1-based attempt number. `on_retry` is called before
  /// each backoff sleep with the failed attempt, its error and the delay.
  /// An attempt in flight is never interrupted; cancellation only cuts a
  /// backoff sleep short.
  pub async fn run<T, F, Fut, R>(
    &self,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut op: F,
  ) -> RetryOutcome<T>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
    R: FnMut(u32, &TaskError, Duration),
  {
    let mut attempt = 1;
    loop {
      match op(attempt).await {
        Ok(value) => {
          return RetryOutcome::Succeeded {
            value,
            attempts: attempt,
          };
        }
        Err(error) if !error.is_transient() || attempt >= self.max_attempts => {
          return RetryOutcome::Failed {
            error,
            attempts: attempt,
          };
        }
        Err(error) => {
          let delay = self.delay(attempt);
          on_retry(attempt, &error, delay);

          tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return RetryOutcome::Interrupted,
          }
          attempt += 1;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[test]
  fn test_delays_follow_backoff() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(1), Duration::from_secs(2));
    assert_eq!(policy.delay(2), Duration::from_secs(4));
    assert_eq!(policy.delay(5), Duration::from_secs(32));
    assert_eq!(policy.delay(6), Duration::from_secs(60));
  }

  #[test]
  fn test_delay_is_bounded() {
    let policy = RetryPolicy {
      max_attempts: u32::MAX,
      ..RetryPolicy::default()
    };
    assert_eq!(policy.delay(2_000), Duration::from_secs(60));
    assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));

    for backoff_rate in [f64::NAN, f64::INFINITY] {
      let policy = RetryPolicy {
        backoff_rate,
        ..RetryPolicy::default()
      };
      assert_eq!(policy.delay(2), Duration::from_secs(60));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_retried() {
    let policy = RetryPolicy::default();
    let calls = Arc::new(AtomicU32::new(0));
    let mut delays = Vec::new();

    let outcome = policy
      .run(
        &CancellationToken::new(),
        |_, _, delay| delays.push(delay),
        |attempt| {
          let calls = calls.clone();
          async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
              Err(TaskError::transient("throttled"))
            } else {
              Ok("done")
            }
          }
        },
      )
      .await;

    assert_eq!(
      outcome,
      RetryOutcome::Succeeded {
        value: "done",
        attempts: 3
      }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_max_attempts() {
    let policy = RetryPolicy::default();
    let outcome: RetryOutcome<()> = policy
      .run(
        &CancellationToken::new(),
        |_, _, _| {},
        |_| async { Err(TaskError::transient("503")) },
      )
      .await;

    assert_eq!(
      outcome,
      RetryOutcome::Failed {
        error: TaskError::transient("503"),
        attempts: 6
      }
    );
  }

  #[tokio::test]
  async fn test_logic_errors_are_not_retried() {
    let policy = RetryPolicy::default();
    let outcome: RetryOutcome<()> = policy
      .run(
        &CancellationToken::new(),
        |_, _, _| panic!("must not retry"),
        |_| async { Err(TaskError::logic("bad document")) },
      )
      .await;

    assert_eq!(
      outcome,
      RetryOutcome::Failed {
        error: TaskError::logic("bad document"),
        attempts: 1
      }
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_interrupts_backoff() {
    let policy = RetryPolicy::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome: RetryOutcome<()> = policy
      .run(&cancel, |_, _, _| {}, |_| async {
        Err(TaskError::transient("timeout"))
      })
      .await;

    assert_eq!(outcome, RetryOutcome::Interrupted);
  }
}
