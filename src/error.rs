//! Error taxonomy for session orchestration
//!
//! Identity/state/scope/not-found errors propagate synchronously to the
//! caller. Backend failures are wrapped and contained at the queue boundary.

use thiserror::Error;

use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The caller's session id does not match the session loaded for the path.
    #[error("session id mismatch: loaded {loaded}, requested {requested}")]
    IdentityMismatch { loaded: String, requested: String },

    /// The operation is not legal for the session's current status.
    #[error("{operation} is not valid while session status is {status:?}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    /// Target path is outside the registered project roots.
    #[error("path outside registered project roots: {0}")]
    OutOfScope(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
