//! docflow HTTP collaborators
//!
//! reqwest-backed implementations of the engine's [`docflow_engine::TaskInvoker`]
//! and [`docflow_engine::AnalysisService`] traits.
//!
//! Failures are classified for the engine's retry policy: connection errors,
//! timeouts, 408, 429 and 5xx responses are transient; any other non-success
//! status or an undecodable body is a logic failure.

mod analysis;
mod endpoint;
mod error;
mod tasks;

pub use analysis::HttpAnalysisService;
pub use error::ClientError;
pub use tasks::HttpTaskInvoker;
