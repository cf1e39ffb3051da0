//! docflow Store
//!
//! This crate provides the storage trait and implementations for workflow
//! executions. Data is persisted to SQLite, or held in memory for tests and
//! ephemeral runs.
//!
//! The [`Store`] trait defines operations for:
//! - Creating executions and checkpointing them after every state
//! - Leasing each running execution to a single worker, and carrying cancel
//!   requests to that worker
//! - Recording the output of each step, once per `(execution, state)`
//! - Holding start requests that could not be accepted (dead letters)

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use sqlx::types::Json;
pub use types::{Checkpoint, DeadLetter, ExecutionRecord, ExecutionStatus, Lease, StepRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// The write lost a race: the execution is terminal or held by another
  /// worker.
  #[error("conflict: {0}")]
  Conflict(String),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for workflow executions, steps and dead letters.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new workflow execution.
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error>;

  /// Get a workflow execution by ID.
  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error>;

  /// Take the lease of a running execution that is unowned, already held by
  /// `lease.owner`, or whose lease expired before `now`. Returns whether the
  /// lease was taken.
  async fn claim_execution(
    &self,
    execution_id: &str,
    lease: &Lease,
    now: DateTime<Utc>,
  ) -> Result<bool, Error>;

  /// Give up the lease of a running execution held by `owner`.
  async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<(), Error>;

  /// Persist the state and context of a running execution and renew its
  /// lease. Fails with [`Error::Conflict`] unless the execution is running
  /// and held by `lease.owner`.
  async fn save_checkpoint(
    &self,
    execution_id: &str,
    lease: &Lease,
    checkpoint: &Checkpoint,
  ) -> Result<(), Error>;

  /// Persist the final checkpoint and mark the execution terminal.
  ///
  /// Only the owner of a running execution can complete it; any other write
  /// fails with [`Error::Conflict`] and leaves the record untouched.
  async fn complete_execution(
    &self,
    execution_id: &str,
    owner: &str,
    status: ExecutionStatus,
    checkpoint: &Checkpoint,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
  ) -> Result<(), Error>;

  /// Ask the owner of a running execution to cancel it. Fails with
  /// [`Error::Conflict`] if the execution is already terminal.
  async fn request_cancel(&self, execution_id: &str) -> Result<(), Error>;

  async fn cancel_requested(&self, execution_id: &str) -> Result<bool, Error>;

  /// List executions, optionally filtered by status, oldest first.
  async fn list_executions(
    &self,
    status: Option<ExecutionStatus>,
  ) -> Result<Vec<ExecutionRecord>, Error>;

  /// Insert or replace the record for `(step.execution_id, step.state)`.
  async fn upsert_step(&self, step: &StepRecord) -> Result<(), Error>;

  /// Get the recorded step for a state, if it has completed.
  async fn get_step(&self, execution_id: &str, state: &str) -> Result<Option<StepRecord>, Error>;

  /// List the recorded steps of an execution in completion order.
  async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, Error>;

  async fn push_dead_letter(&self, letter: &DeadLetter) -> Result<(), Error>;

  async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, Error>;

  async fn remove_dead_letter(&self, id: &str) -> Result<(), Error>;
}
