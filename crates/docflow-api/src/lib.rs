//! docflow API
//!
//! The inbound trigger and status queries over HTTP:
//!
//! - `POST /process-document` starts an execution (`202 {"executionId"}`)
//! - `GET /executions/{id}` reports its status
//! - `POST /executions/{id}/cancel` requests cancellation
//! - `GET /health`

mod error;
mod routes;

pub use error::ApiError;
pub use routes::{ApiState, StartResponse, StatusResponse, router};
