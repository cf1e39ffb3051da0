//! docflow Engine
//!
//! This crate drives the document-processing workflow. Each execution runs as
//! its own tokio task, is checkpointed to a [`docflow_store::Store`] after
//! every state, and talks to the outside world only through the
//! [`TaskInvoker`] and [`AnalysisService`] traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRunner                         │
//! │  - owns mpsc channel (sender + receiver)                    │
//! │  - start(cancel) runs the intake loop                       │
//! │  - rejected requests become dead letters                    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                         │
//! │  - start / get_status / cancel / resume / wait              │
//! │  - one spawned task per execution                           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Execution                            │
//! │  - runs one state at a time, checkpoints after each         │
//! │  - retries transient faults with exponential backoff        │
//! │  - reuses recorded step output on resume                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use docflow_engine::{EngineConfig, WorkflowEngine};
//!
//! let engine = WorkflowEngine::new(EngineConfig::default(), store, tasks, analysis);
//! let execution_id = engine.start(payload).await?;
//! let outcome = engine.wait(&execution_id).await?;
//! ```

mod alarm;
mod collaborator;
mod engine;
mod error;
mod events;
mod execution;
mod retry;
mod runner;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use alarm::{Alert, ErrorAlarm};
pub use collaborator::{
  AnalysisRequest, AnalysisService, DocumentLocation, OutputConfig, S3Object, TaskError,
  TaskInvocation, TaskInvoker, TaskName,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use error::EngineError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, FanoutNotifier, NoopNotifier};
pub use retry::{RetryOutcome, RetryPolicy};
pub use runner::{RedriveReport, WorkflowRunner, accept, dead_letter, redrive};
