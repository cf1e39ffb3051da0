use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::TransitionError;
use crate::job::JobStatus;

/// What a state does when the engine reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
  /// Delegates to an external worker or service.
  Task,
  /// Suspends the execution for the poll interval.
  Timer,
  /// Branches on a field of the context.
  Choice,
  /// Reshapes context fields without calling out.
  Transform,
  Terminal,
}

/// A state of the document-processing workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
  StartWorkflow,
  ExtractDocument,
  StartAnalysis,
  WaitForAnalysis,
  CheckAnalysisStatus,
  DecideAnalysis,
  PrepareResult,
  ProcessDocument,
  Notify,
  DecideNotify,
  Succeeded,
  Failed,
}

impl State {
  pub const INITIAL: State = State::StartWorkflow;

  pub const ALL: [State; 12] = [
    State::StartWorkflow,
    State::ExtractDocument,
    State::StartAnalysis,
    State::WaitForAnalysis,
    State::CheckAnalysisStatus,
    State::DecideAnalysis,
    State::PrepareResult,
    State::ProcessDocument,
    State::Notify,
    State::DecideNotify,
    State::Succeeded,
    State::Failed,
  ];

  pub fn name(self) -> &'static str {
    match self {
      State::StartWorkflow => "StartWorkflow",
      State::ExtractDocument => "ExtractDocument",
      State::StartAnalysis => "StartAnalysis",
      State::WaitForAnalysis => "WaitForAnalysis",
      State::CheckAnalysisStatus => "CheckAnalysisStatus",
      State::DecideAnalysis => "DecideAnalysis",
      State::PrepareResult => "PrepareResult",
      State::ProcessDocument => "ProcessDocument",
      State::Notify => "Notify",
      State::DecideNotify => "DecideNotify",
      State::Succeeded => "Succeeded",
      State::Failed => "Failed",
    }
  }

  pub fn kind(self) -> StateKind {
    match self {
      State::StartWorkflow
      | State::ExtractDocument
      | State::StartAnalysis
      | State::CheckAnalysisStatus
      | State::ProcessDocument
      | State::Notify => StateKind::Task,
      State::WaitForAnalysis => StateKind::Timer,
      State::DecideAnalysis | State::DecideNotify => StateKind::Choice,
      State::PrepareResult => StateKind::Transform,
      State::Succeeded | State::Failed => StateKind::Terminal,
    }
  }

  pub fn is_terminal(self) -> bool {
    self.kind() == StateKind::Terminal
  }

  /// Whether the state is part of the wait/check polling pair, the only
  /// states an execution may visit more than once.
  pub fn is_polling(self) -> bool {
    matches!(self, State::WaitForAnalysis | State::CheckAnalysisStatus)
  }

  /// The successor once this state's own work has completed.
  ///
  /// Task failures never reach this point; the engine routes them straight to
  /// [`State::Failed`]. Choice states branch on the context.
  pub fn next(self, ctx: &ExecutionContext) -> Result<State, TransitionError> {
    let next = match self {
      State::StartWorkflow => State::ExtractDocument,
      State::ExtractDocument => State::StartAnalysis,
      State::StartAnalysis => State::WaitForAnalysis,
      State::WaitForAnalysis => State::CheckAnalysisStatus,
      State::CheckAnalysisStatus => State::DecideAnalysis,
      State::DecideAnalysis => {
        let status = ctx.job_status().ok_or(TransitionError::MissingField {
          state: self,
          key: "textractJobStatus",
        })?;
        match status.status {
          JobStatus::Succeeded => State::PrepareResult,
          JobStatus::Failed => State::Failed,
          JobStatus::InProgress | JobStatus::PartialSuccess => State::WaitForAnalysis,
        }
      }
      State::PrepareResult => State::ProcessDocument,
      State::ProcessDocument => State::Notify,
      State::Notify => State::DecideNotify,
      State::DecideNotify => {
        let status_code = ctx.status_code().ok_or(TransitionError::MissingField {
          state: self,
          key: "statusCode",
        })?;
        if status_code == 200 {
          State::Succeeded
        } else {
          State::Failed
        }
      }
      State::Succeeded | State::Failed => return Err(TransitionError::Terminal(self)),
    };
    Ok(next)
  }
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for State {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    State::ALL
      .into_iter()
      .find(|state| state.name() == s)
      .ok_or_else(|| format!("unknown state '{}'", s))
  }
}
