//! Session store errors.

use crate::types::{Platform, SessionStatus};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Invalid session input: {0}")]
    Validation(String),

    #[error("Registration session not found: {0}")]
    NotFound(String),

    #[error("Registration session expired: {0}")]
    Expired(String),

    #[error("Registration session {id} is {status}")]
    Terminal { id: String, status: SessionStatus },

    #[error("Platform not selected for this registration: {0}")]
    PlatformNotSelected(Platform),

    #[error("OAuth state already in use")]
    StateCollision,

    #[error("No outstanding authorization for {0} matches the returned state")]
    StateMismatch(Platform),

    #[error("Integrations not connected: {missing:?}")]
    Incomplete { missing: Vec<Platform> },

    #[error("Completion already in progress for session {0}")]
    CompletionInProgress(String),
}
