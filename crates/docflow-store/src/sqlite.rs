use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;

use crate::{
  Checkpoint, DeadLetter, Error, ExecutionRecord, ExecutionStatus, Lease, StepRecord, Store,
};

const EXECUTION_COLUMNS: &str = "execution_id, status, current_state, request, context, poll_count, error, owner, lease_expires_at, cancel_requested, started_at, updated_at, completed_at";

/// SQLite-based store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and run migrations.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A migrated store backed by a private in-memory database.
  pub async fn in_memory() -> Result<Self, Error> {
    // Every connection to `sqlite::memory:` gets its own database.
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  /// The error for a conditional write that matched no row.
  async fn rejected(&self, execution_id: &str) -> Error {
    match self.get_execution(execution_id).await {
      Ok(record) if record.status != ExecutionStatus::Running => {
        Error::Conflict(format!("execution '{}' is already {}", execution_id, record.status))
      }
      Ok(_) => Error::Conflict(format!(
        "execution '{}' is held by another worker",
        execution_id
      )),
      Err(e) => e,
    }
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO workflow_executions (execution_id, status, current_state, request, context, poll_count, error, owner, lease_expires_at, cancel_requested, started_at, updated_at, completed_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&execution.execution_id)
    .bind(execution.status)
    .bind(&execution.current_state)
    .bind(&execution.request)
    .bind(&execution.context)
    .bind(execution.poll_count)
    .bind(&execution.error)
    .bind(&execution.owner)
    .bind(execution.lease_expires_at)
    .bind(execution.cancel_requested)
    .bind(execution.started_at)
    .bind(execution.updated_at)
    .bind(execution.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    let query = format!(
      "SELECT {} FROM workflow_executions WHERE execution_id = ?",
      EXECUTION_COLUMNS
    );
    sqlx::query_as(&query)
      .bind(execution_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("execution '{}'", execution_id)))
  }

  async fn claim_execution(
    &self,
    execution_id: &str,
    lease: &Lease,
    now: DateTime<Utc>,
  ) -> Result<bool, Error> {
    let result = sqlx::query(
      r#"
      UPDATE workflow_executions
      SET owner = ?, lease_expires_at = ?
      WHERE execution_id = ? AND status = ?
        AND (owner IS NULL OR owner = ? OR lease_expires_at IS NULL OR lease_expires_at < ?)
      "#,
    )
    .bind(&lease.owner)
    .bind(lease.expires_at)
    .bind(execution_id)
    .bind(ExecutionStatus::Running)
    .bind(&lease.owner)
    .bind(now)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<(), Error> {
    sqlx::query(
      r#"
      UPDATE workflow_executions
      SET owner = NULL, lease_expires_at = NULL
      WHERE execution_id = ? AND status = ? AND owner = ?
      "#,
    )
    .bind(execution_id)
    .bind(ExecutionStatus::Running)
    .bind(owner)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn save_checkpoint(
    &self,
    execution_id: &str,
    lease: &Lease,
    checkpoint: &Checkpoint,
  ) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE workflow_executions
      SET current_state = ?, context = ?, poll_count = ?, lease_expires_at = ?, updated_at = ?
      WHERE execution_id = ? AND status = ? AND owner = ?
      "#,
    )
    .bind(&checkpoint.current_state)
    .bind(Json(&checkpoint.context))
    .bind(checkpoint.poll_count)
    .bind(lease.expires_at)
    .bind(Utc::now())
    .bind(execution_id)
    .bind(ExecutionStatus::Running)
    .bind(&lease.owner)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(self.rejected(execution_id).await);
    }
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
    let result = sqlx::query(
      r#"
      UPDATE workflow_executions
      SET status = ?, current_state = ?, context = ?, poll_count = ?, error = ?,
          owner = NULL, lease_expires_at = NULL, updated_at = ?, completed_at = ?
      WHERE execution_id = ? AND status = ? AND owner = ?
      "#,
    )
    .bind(status)
    .bind(&checkpoint.current_state)
    .bind(Json(&checkpoint.context))
    .bind(checkpoint.poll_count)
    .bind(error)
    .bind(completed_at)
    .bind(completed_at)
    .bind(execution_id)
    .bind(ExecutionStatus::Running)
    .bind(owner)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(self.rejected(execution_id).await);
    }
    Ok(())
  }

  async fn request_cancel(&self, execution_id: &str) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE workflow_executions
      SET cancel_requested = 1, updated_at = ?
      WHERE execution_id = ? AND status = ?
      "#,
    )
    .bind(Utc::now())
    .bind(execution_id)
    .bind(ExecutionStatus::Running)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(self.rejected(execution_id).await);
    }
    Ok(())
  }

  async fn cancel_requested(&self, execution_id: &str) -> Result<bool, Error> {
    sqlx::query_scalar("SELECT cancel_requested FROM workflow_executions WHERE execution_id = ?")
      .bind(execution_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("execution '{}'", execution_id)))
  }

  async fn list_executions(
    &self,
    status: Option<ExecutionStatus>,
  ) -> Result<Vec<ExecutionRecord>, Error> {
    let rows: Vec<ExecutionRecord> = match status {
      Some(status) => {
        let query = format!(
          "SELECT {} FROM workflow_executions WHERE status = ? ORDER BY started_at ASC",
          EXECUTION_COLUMNS
        );
        sqlx::query_as(&query)
          .bind(status)
          .fetch_all(&self.pool)
          .await?
      }
      None => {
        let query = format!(
          "SELECT {} FROM workflow_executions ORDER BY started_at ASC",
          EXECUTION_COLUMNS
        );
        sqlx::query_as(&query).fetch_all(&self.pool).await?
      }
    };
    Ok(rows)
  }

  async fn upsert_step(&self, step: &StepRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO workflow_steps (execution_id, state, attempts, output, error, completed_at)
      VALUES (?, ?, ?, ?, ?, ?)
      ON CONFLICT (execution_id, state) DO UPDATE SET
        attempts = excluded.attempts,
        output = excluded.output,
        error = excluded.error,
        completed_at = excluded.completed_at
      "#,
    )
    .bind(&step.execution_id)
    .bind(&step.state)
    .bind(step.attempts)
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_step(&self, execution_id: &str, state: &str) -> Result<Option<StepRecord>, Error> {
    let step: Option<StepRecord> = sqlx::query_as(
      r#"
      SELECT execution_id, state, attempts, output, error, completed_at
      FROM workflow_steps
      WHERE execution_id = ? AND state = ?
      "#,
    )
    .bind(execution_id)
    .bind(state)
    .fetch_optional(&self.pool)
    .await?;

    Ok(step)
  }

  async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, Error> {
    let steps = sqlx::query_as(
      r#"
      SELECT execution_id, state, attempts, output, error, completed_at
      FROM workflow_steps
      WHERE execution_id = ?
      ORDER BY completed_at ASC
      "#,
    )
    .bind(execution_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(steps)
  }

  async fn push_dead_letter(&self, letter: &DeadLetter) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO dead_letters (id, payload, reason, received_at)
      VALUES (?, ?, ?, ?)
      "#,
    )
    .bind(&letter.id)
    .bind(&letter.payload)
    .bind(&letter.reason)
    .bind(letter.received_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
    let letters = sqlx::query_as(
      r#"
      SELECT id, payload, reason, received_at
      FROM dead_letters
      ORDER BY received_at ASC
      "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(letters)
  }

  async fn remove_dead_letter(&self, id: &str) -> Result<(), Error> {
    let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("dead letter '{}'", id)));
    }
    Ok(())
  }
}
