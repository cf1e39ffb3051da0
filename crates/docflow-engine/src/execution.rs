//! A single execution driven through the workflow's states.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use docflow_store::{Checkpoint, ExecutionStatus, Json, StepRecord};
use docflow_workflow::{
  ContextError, DocumentRef, ExecutionContext, ExecutionError, ExecutionOutcome, FailureKind,
  State,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborator::{
  AnalysisRequest, AnalysisService, TaskError, TaskInvocation, TaskInvoker, TaskName,
};
use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::retry::RetryOutcome;

/// What happened when a state ran.
enum StepOutcome {
  Completed {
    next: State,
    output: Option<Value>,
    attempts: u32,
  },
  Failed {
    error: ExecutionError,
    attempts: u32,
  },
  /// Cancellation or shutdown fired mid-state. The state has no effect and
  /// is re-entered (or abandoned) at the top of the loop.
  Interrupted,
}

/// Outcome of a collaborator call: its value and attempt count, or the step
/// outcome to return instead.
type Called<T> = Result<(T, u32), StepOutcome>;

pub(crate) struct Execution {
  inner: Arc<EngineInner>,
  execution_id: String,
  state: State,
  context: ExecutionContext,
  poll_count: u32,
  cancel: CancellationToken,
}

impl Execution {
  pub(crate) fn new(
    inner: Arc<EngineInner>,
    execution_id: String,
    state: State,
    context: ExecutionContext,
    poll_count: u32,
  ) -> Self {
    let cancel = inner.shutdown.child_token();
    Self {
      inner,
      execution_id,
      state,
      context,
      poll_count,
      cancel,
    }
  }

  pub(crate) fn id(&self) -> &str {
    &self.execution_id
  }

  pub(crate) fn state(&self) -> State {
    self.state
  }

  /// Fires on cancellation of this execution and on engine shutdown.
  pub(crate) fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Drive the execution until it reaches a terminal state.
  ///
  /// Returns `None` if the engine shut down first, or if another engine took
  /// the execution over or completed it; the stored record then belongs to
  /// whoever holds it.
  #[instrument(
    name = "workflow_execute",
    skip(self),
    fields(execution_id = %self.execution_id)
  )]
  pub(crate) async fn run(mut self) -> Result<Option<ExecutionOutcome>, EngineError> {
    loop {
      if self.state.is_terminal() {
        return self.finish().await;
      }

      if self.inner.shutdown.is_cancelled() {
        info!(
          execution_id = %self.execution_id,
          state = %self.state,
          "workflow_suspended"
        );
        return Ok(None);
      }

      if !self.cancel.is_cancelled()
        && self
          .inner
          .store
          .cancel_requested(&self.execution_id)
          .await?
      {
        self.cancel.cancel();
      }

      if self.cancel.is_cancelled() {
        warn!(
          execution_id = %self.execution_id,
          state = %self.state,
          "workflow_cancelled"
        );
        self.fail(ExecutionError::cancelled(self.state));
        continue;
      }

      let state = self.state;
      debug!(execution_id = %self.execution_id, state = %state, "state_entered");
      self.inner.notifier.notify(ExecutionEvent::StateEntered {
        execution_id: self.execution_id.clone(),
        state,
      });

      match self.step().await? {
        StepOutcome::Interrupted => continue,
        StepOutcome::Completed {
          next,
          output,
          attempts,
        } => {
          if output.is_some() || attempts > 0 {
            self.record_step(state, attempts, output, None).await?;
          }
          // The wait/check pair repeats on every poll.
          if state.is_polling() {
            debug!(
              execution_id = %self.execution_id,
              state = %state,
              next = %next,
              "state_completed"
            );
          } else {
            info!(
              execution_id = %self.execution_id,
              state = %state,
              next = %next,
              "state_completed"
            );
          }
          self.inner.notifier.notify(ExecutionEvent::StateCompleted {
            execution_id: self.execution_id.clone(),
            state,
            next,
          });
          self.state = next;
        }
        StepOutcome::Failed { error, attempts } => {
          if attempts > 0 {
            self
              .record_step(state, attempts, None, Some(error.to_string()))
              .await?;
          }
          warn!(
            execution_id = %self.execution_id,
            state = %state,
            kind = %error.kind,
            error = %error.message,
            "state_failed"
          );
          self.fail(error);
        }
      }

      let checkpoint = self.checkpoint()?;
      let saved = self
        .inner
        .store
        .save_checkpoint(&self.execution_id, &self.inner.lease(), &checkpoint)
        .await;
      if !self.keep_ownership(saved)? {
        return Ok(None);
      }
    }
  }

  /// Whether a conditional write went through. A conflict means another
  /// engine now holds the execution or has completed it.
  fn keep_ownership(&self, written: Result<(), docflow_store::Error>) -> Result<bool, EngineError> {
    match written {
      Ok(()) => Ok(true),
      Err(docflow_store::Error::Conflict(reason)) => {
        warn!(
          execution_id = %self.execution_id,
          state = %self.state,
          reason = %reason,
          "workflow_ownership_lost"
        );
        Ok(false)
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn step(&mut self) -> Result<StepOutcome, EngineError> {
    match self.state {
      State::StartWorkflow => self.start_workflow().await,
      State::ExtractDocument => self.extract_document().await,
      State::StartAnalysis => self.start_analysis().await,
      State::WaitForAnalysis => Ok(self.wait_for_analysis().await),
      State::CheckAnalysisStatus => self.check_analysis_status().await,
      State::DecideAnalysis => Ok(self.decide_analysis()),
      State::PrepareResult => self.prepare_result(),
      State::ProcessDocument => self.process_document().await,
      State::Notify => self.notify().await,
      State::DecideNotify => Ok(self.decide_notify()),
      State::Succeeded | State::Failed => Ok(StepOutcome::Interrupted),
    }
  }

  async fn start_workflow(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::StartWorkflow;
    let input = serde_json::to_value(self.context.request())?;
    let (output, attempts) = match self.invoke_task(state, TaskName::StartWorkflow, input).await? {
      Ok(called) => called,
      Err(outcome) => return Ok(outcome),
    };

    let write = self.context.record_start_result(output.clone());
    Ok(self.advance(state, write, Some(output), attempts))
  }

  async fn extract_document(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::ExtractDocument;
    let input = serde_json::to_value(self.context.request())?;
    let (output, attempts) = match self.invoke_task(state, TaskName::Extraction, input).await? {
      Ok(called) => called,
      Err(outcome) => return Ok(outcome),
    };

    let document = match check_worker_status(TaskName::Extraction, &output)
      .and_then(|()| extraction_payload(&output))
    {
      Ok(document) => document,
      Err(message) => return Ok(logic_failure(state, message, attempts)),
    };

    if !document.matches(self.context.request()) {
      let request = self.context.request();
      let message = format!(
        "extraction returned document {}/{}, expected {}/{}",
        document.document_id, document.file_info_id, request.document_id, request.file_info_id
      );
      return Ok(logic_failure(state, message, attempts));
    }

    let write = self.context.record_extraction(document);
    Ok(self.advance(state, write, Some(output), attempts))
  }

  async fn start_analysis(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::StartAnalysis;
    let Some(document) = self.context.document() else {
      return Ok(logic_failure(state, "no extraction payload to analyse", 0));
    };
    let request =
      AnalysisRequest::for_document(document, &self.inner.config.analysis_output_bucket);

    let recorded = self
      .recorded_output(state)
      .await?
      .and_then(|(output, attempts)| {
        let job_id = output.get("jobId")?.as_str()?.to_string();
        Some((job_id, attempts))
      });

    let (job_id, attempts) = match recorded {
      Some(recorded) => recorded,
      None => {
        let analysis: &dyn AnalysisService = self.inner.analysis.as_ref();
        let request = &request;
        match self
          .with_retry(state, move |_| analysis.start_analysis(request))
          .await
        {
          Ok(called) => called,
          Err(outcome) => return Ok(outcome),
        }
      }
    };

    info!(
      execution_id = %self.execution_id,
      job_id = %job_id,
      prefix = %request.output_config.s3_prefix,
      "analysis_started"
    );
    let output = json!({ "jobId": job_id });
    let write = self.context.record_job_id(job_id);
    Ok(self.advance(state, write, Some(output), attempts))
  }

  async fn wait_for_analysis(&self) -> StepOutcome {
    let state = State::WaitForAnalysis;
    let job = self.context.analysis_job();
    if let Some(max_polls) = self.inner.config.max_polls
      && self.poll_count >= max_polls
    {
      let message = format!(
        "analysis job {} not finished after {} status checks",
        job.as_ref().map_or("<unknown>", |job| job.job_id.as_str()),
        self.poll_count
      );
      return StepOutcome::Failed {
        error: ExecutionError::new(state, FailureKind::PollTimeout, message),
        attempts: 0,
      };
    }

    if let Some(job) = &job {
      debug!(
        execution_id = %self.execution_id,
        job_id = %job.job_id,
        job_status = %job.status,
        polls = self.poll_count,
        "analysis_wait"
      );
    }
    tokio::select! {
      _ = tokio::time::sleep(self.inner.config.poll_interval) => {
        self.advance(state, Ok(()), None, 0)
      }
      _ = self.cancel.cancelled() => StepOutcome::Interrupted,
    }
  }

  async fn check_analysis_status(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::CheckAnalysisStatus;
    let Some(job_id) = self.context.job_id().map(str::to_string) else {
      return Ok(logic_failure(state, "no analysis job to check", 0));
    };

    let analysis: &dyn AnalysisService = self.inner.analysis.as_ref();
    let job = job_id.as_str();
    let (status, attempts) = match self
      .with_retry(state, move |_| analysis.get_analysis_status(job))
      .await
    {
      Ok(called) => called,
      Err(outcome) => return Ok(outcome),
    };

    self.poll_count += 1;
    info!(
      execution_id = %self.execution_id,
      job_id = %job_id,
      job_status = %status.status,
      poll = self.poll_count,
      "analysis_status_checked"
    );

    let output = serde_json::to_value(&status)?;
    self.context.record_job_status(status);
    Ok(self.advance(state, Ok(()), Some(output), attempts))
  }

  fn decide_analysis(&self) -> StepOutcome {
    let state = State::DecideAnalysis;
    match state.next(&self.context) {
      Ok(State::Failed) => {
        let job = self.context.analysis_job();
        let message = format!(
          "analysis job {} failed",
          job.as_ref().map_or("<unknown>", |job| job.job_id.as_str())
        );
        logic_failure(state, message, 0)
      }
      Ok(next) => StepOutcome::Completed {
        next,
        output: None,
        attempts: 0,
      },
      Err(e) => logic_failure(state, e.to_string(), 0),
    }
  }

  fn prepare_result(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::PrepareResult;
    let result = match self.context.prepare_result() {
      Ok(result) => result,
      Err(e) => return Ok(logic_failure(state, e.to_string(), 0)),
    };

    let output = serde_json::to_value(&result)?;
    let write = self.context.record_processing_result(result);
    Ok(self.advance(state, write, Some(output), 0))
  }

  async fn process_document(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::ProcessDocument;
    let Some(result) = self.context.processing_result() else {
      return Ok(logic_failure(state, "no processing result prepared", 0));
    };
    let input = json!({ "processingResult": result });

    let (output, attempts) = match self.invoke_task(state, TaskName::Processing, input).await? {
      Ok(called) => called,
      Err(outcome) => return Ok(outcome),
    };

    if let Err(message) = check_worker_status(TaskName::Processing, &output) {
      return Ok(logic_failure(state, message, attempts));
    }

    let write = self.context.record_processing_output(output.clone());
    Ok(self.advance(state, write, Some(output), attempts))
  }

  async fn notify(&mut self) -> Result<StepOutcome, EngineError> {
    let state = State::Notify;
    let input = self.context.processing_output().cloned().unwrap_or_default();

    let (output, attempts) = match self.invoke_task(state, TaskName::Notify, input).await? {
      Ok(called) => called,
      Err(outcome) => return Ok(outcome),
    };

    let Some(status_code) = status_code(&output) else {
      return Ok(logic_failure(
        state,
        "notify output has no statusCode",
        attempts,
      ));
    };

    let write = self.context.record_status_code(status_code);
    Ok(self.advance(state, write, Some(output), attempts))
  }

  fn decide_notify(&self) -> StepOutcome {
    let state = State::DecideNotify;
    match state.next(&self.context) {
      Ok(State::Failed) => {
        let message = format!(
          "notification returned status {}",
          self.context.status_code().unwrap_or_default()
        );
        logic_failure(state, message, 0)
      }
      Ok(next) => StepOutcome::Completed {
        next,
        output: None,
        attempts: 0,
      },
      Err(e) => logic_failure(state, e.to_string(), 0),
    }
  }

  /// Invoke a worker for a once-only state, reusing its recorded output if
  /// the state already completed in an earlier run.
  #[instrument(
    name = "task_invoke",
    skip_all,
    fields(execution_id = %self.execution_id, state = %state, task = %task)
  )]
  async fn invoke_task(
    &self,
    state: State,
    task: TaskName,
    input: Value,
  ) -> Result<Called<Value>, EngineError> {
    if let Some(recorded) = self.recorded_output(state).await? {
      return Ok(Ok(recorded));
    }

    let tasks: &dyn TaskInvoker = self.inner.tasks.as_ref();
    let execution_id = self.execution_id.as_str();
    let idempotency_key = format!("{}:{}", self.execution_id, state);

    Ok(
      self
        .with_retry(state, move |attempt| {
          tasks.invoke(TaskInvocation {
            task,
            execution_id: execution_id.to_string(),
            idempotency_key: idempotency_key.clone(),
            attempt,
            input: input.clone(),
          })
        })
        .await,
    )
  }

  /// Run a collaborator call under the engine's retry policy.
  async fn with_retry<T, F, Fut>(&self, state: State, op: F) -> Called<T>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
  {
    let execution_id = self.execution_id.as_str();
    let notifier = &self.inner.notifier;
    let on_retry = |attempt: u32, error: &TaskError, delay: std::time::Duration| {
      let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
      warn!(
        execution_id = %execution_id,
        state = %state,
        attempt,
        delay_ms,
        error = %error,
        "task_retrying"
      );
      notifier.notify(ExecutionEvent::TaskRetrying {
        execution_id: execution_id.to_string(),
        state,
        attempt,
        delay_ms,
        error: error.to_string(),
      });
    };

    match self.inner.config.retry.run(&self.cancel, on_retry, op).await {
      RetryOutcome::Succeeded { value, attempts } => Ok((value, attempts)),
      RetryOutcome::Failed { error, attempts } => Err(StepOutcome::Failed {
        error: task_failure(state, error, attempts),
        attempts,
      }),
      RetryOutcome::Interrupted => Err(StepOutcome::Interrupted),
    }
  }

  /// The output of a state that already completed in an earlier run.
  async fn recorded_output(&self, state: State) -> Result<Option<(Value, u32)>, EngineError> {
    let Some(step) = self
      .inner
      .store
      .get_step(&self.execution_id, state.name())
      .await?
    else {
      return Ok(None);
    };

    match (step.output, step.error) {
      (Some(Json(output)), None) => {
        info!(
          execution_id = %self.execution_id,
          state = %state,
          "step_reused"
        );
        Ok(Some((output, u32::try_from(step.attempts).unwrap_or(1))))
      }
      _ => Ok(None),
    }
  }

  async fn record_step(
    &self,
    state: State,
    attempts: u32,
    output: Option<Value>,
    error: Option<String>,
  ) -> Result<(), EngineError> {
    let step = StepRecord {
      execution_id: self.execution_id.clone(),
      state: state.name().to_string(),
      attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
      output: output.map(Json),
      error,
      completed_at: Utc::now(),
    };
    self.inner.store.upsert_step(&step).await?;
    Ok(())
  }

  /// Successor of `state` once its context write has been applied.
  fn advance(
    &self,
    state: State,
    write: Result<(), ContextError>,
    output: Option<Value>,
    attempts: u32,
  ) -> StepOutcome {
    let next = write
      .map_err(|e| e.to_string())
      .and_then(|()| state.next(&self.context).map_err(|e| e.to_string()));

    match next {
      Ok(next) => StepOutcome::Completed {
        next,
        output,
        attempts,
      },
      Err(message) => logic_failure(state, message, attempts),
    }
  }

  fn fail(&mut self, error: ExecutionError) {
    if let Err(e) = self.context.record_error(error) {
      warn!(execution_id = %self.execution_id, error = %e, "execution_error_already_recorded");
    }
    self.state = State::Failed;
  }

  fn checkpoint(&self) -> Result<Checkpoint, EngineError> {
    Ok(Checkpoint {
      current_state: self.state.name().to_string(),
      context: serde_json::to_value(&self.context)?,
      poll_count: i64::from(self.poll_count),
    })
  }

  async fn finish(self) -> Result<Option<ExecutionOutcome>, EngineError> {
    let checkpoint = self.checkpoint()?;
    let completed_at = Utc::now();
    let owner = self.inner.owner.as_str();

    if self.state == State::Succeeded {
      let written = self
        .inner
        .store
        .complete_execution(
          &self.execution_id,
          owner,
          ExecutionStatus::Succeeded,
          &checkpoint,
          None,
          completed_at,
        )
        .await;
      if !self.keep_ownership(written)? {
        return Ok(None);
      }

      info!(
        execution_id = %self.execution_id,
        polls = self.poll_count,
        "workflow_succeeded"
      );
      self.inner.notifier.notify(ExecutionEvent::WorkflowSucceeded {
        execution_id: self.execution_id.clone(),
      });
      return Ok(Some(ExecutionOutcome::Success(
        self.context.processing_output().cloned().unwrap_or_default(),
      )));
    }

    let failure = self.context.error().cloned().unwrap_or_else(|| {
      ExecutionError::new(self.state, FailureKind::TaskLogicFailure, "execution failed")
    });
    let written = self
      .inner
      .store
      .complete_execution(
        &self.execution_id,
        owner,
        ExecutionStatus::Failed,
        &checkpoint,
        Some(&failure.message),
        completed_at,
      )
      .await;
    if !self.keep_ownership(written)? {
      return Ok(None);
    }

    error!(
      execution_id = %self.execution_id,
      state = %failure.state,
      kind = %failure.kind,
      error = %failure.message,
      "workflow_failed"
    );
    self.inner.notifier.notify(ExecutionEvent::WorkflowFailed {
      execution_id: self.execution_id.clone(),
      state: failure.state,
      kind: failure.kind,
      error: failure.message.clone(),
    });
    Ok(Some(ExecutionOutcome::Failed(failure.message)))
  }
}

fn logic_failure(state: State, message: impl Into<String>, attempts: u32) -> StepOutcome {
  StepOutcome::Failed {
    error: ExecutionError::new(state, FailureKind::TaskLogicFailure, message),
    attempts,
  }
}

fn task_failure(state: State, error: TaskError, attempts: u32) -> ExecutionError {
  match error {
    TaskError::Transient { message } => ExecutionError::new(
      state,
      FailureKind::TransientServiceFault,
      format!("gave up after {} attempts: {}", attempts, message),
    ),
    TaskError::Logic { message } => {
      ExecutionError::new(state, FailureKind::TaskLogicFailure, message)
    }
  }
}

fn status_code(output: &Value) -> Option<u16> {
  output
    .get("statusCode")
    .and_then(Value::as_u64)
    .and_then(|code| u16::try_from(code).ok())
}

/// Workers answer `{statusCode, body}`; anything outside 2xx is a failure.
fn check_worker_status(task: TaskName, output: &Value) -> Result<(), String> {
  match status_code(output) {
    Some(code) if (200..300).contains(&code) => Ok(()),
    Some(code) => {
      let mut message = format!("{} worker returned status {}", task, code);
      if let Some(detail) = failure_detail(output) {
        message.push_str(": ");
        message.push_str(&detail);
      }
      Err(message)
    }
    None => Err(format!("{} worker output has no statusCode", task)),
  }
}

/// The `error` or `message` field of a worker's body, which may be an object
/// or a JSON-encoded string.
fn failure_detail(output: &Value) -> Option<String> {
  let body = match output.get("body")? {
    Value::String(raw) => serde_json::from_str(raw).ok()?,
    other => other.clone(),
  };
  ["error", "message"]
    .iter()
    .find_map(|key| body.get(*key).and_then(Value::as_str).map(str::to_string))
}

fn extraction_payload(output: &Value) -> Result<DocumentRef, String> {
  let body = match output.get("body") {
    Some(Value::String(raw)) => serde_json::from_str(raw)
      .map_err(|e| format!("extraction body is not valid JSON: {}", e))?,
    Some(body) => body.clone(),
    None => return Err("extraction output has no body".to_string()),
  };
  serde_json::from_value(body).map_err(|e| format!("malformed extraction body: {}", e))
}
