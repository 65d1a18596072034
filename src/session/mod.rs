//! Session lifecycle subsystem.

pub mod models;
mod service;

pub use models::{ExecutionRequest, ExecutionResult, SessionRecord, SessionStatus};
pub use service::{CreatedSession, SessionError, SessionService};
