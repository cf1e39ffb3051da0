//! docflow Workflow
//!
//! This crate provides the document-processing workflow as data: the states of
//! the orchestration, the transitions between them, and the execution context
//! threaded through every state.
//!
//! ```text
//! StartWorkflow → ExtractDocument → StartAnalysis → WaitForAnalysis
//!                                                      ▲        │
//!                                                      │        ▼
//!                                         (else) DecideAnalysis ← CheckAnalysisStatus
//!                                                      │
//!                      SUCCEEDED → PrepareResult → ProcessDocument → Notify → DecideNotify
//!                      FAILED    → Failed                               200 → Succeeded
//! ```
//!
//! Nothing here performs I/O. The engine crate drives a [`State`] through an
//! [`ExecutionContext`] and persists both between steps.

mod context;
mod error;
mod job;
mod request;
mod state;
mod status;

pub use context::{ExecutionContext, ExecutionError, FailureKind, ProcessingResult};
pub use error::{ContextError, RequestError, TransitionError};
pub use job::{AnalysisJob, AnalysisStatus, JobStatus, ResultsLocation};
pub use request::{DocumentRef, REQUIRED_FIELDS, WorkflowRequest};
pub use state::{State, StateKind};
pub use status::{ExecutionOutcome, ExecutionStatus};
