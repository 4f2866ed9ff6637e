use thiserror::Error;

use crate::models::Condition;

pub type Result<T> = std::result::Result<T, StudyError>;

/// Why a condition cannot be started yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockReason {
    AwaitingPrevious(Condition),
    Washout { unlock_at: chrono::DateTime<chrono::Utc> },
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockReason::AwaitingPrevious(prev) => {
                write!(f, "waiting for {} to be completed", prev.as_str())
            }
            LockReason::Washout { unlock_at } => {
                write!(f, "washout in effect until {}", unlock_at.to_rfc3339())
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum StudyError {
    /// The case pool has not been seeded.
    #[error("no cases are registered; contact the study administrator")]
    EmptyCasePool,

    #[error("facility not found: {0}")]
    FacilityNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("condition {condition} is locked: {reason}")]
    ConditionLocked {
        condition: Condition,
        reason: LockReason,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is already completed")]
    SessionCompleted(String),

    #[error("case {case_id} is not part of session {session_id}")]
    CaseNotInSession { session_id: String, case_id: String },

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    #[error("reader already registered: {0}")]
    ReaderAlreadyRegistered(String),

    #[error("reader is disabled: {0}")]
    ReaderDisabled(String),

    #[error("no active reading in progress")]
    NoActiveReading,

    #[error("timer cannot {action} while {from}")]
    InvalidTimerTransition {
        from: &'static str,
        action: &'static str,
    },

    /// Must never happen; surfaced loudly instead of repaired.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl StudyError {
    /// Transient failures the caller may retry with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StudyError::Store(_))
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("Invariant violation: {message}");
        StudyError::InvariantViolation(message)
    }
}

impl From<rusqlite::Error> for StudyError {
    fn from(err: rusqlite::Error) -> Self {
        StudyError::Store(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for StudyError {
    fn from(err: serde_json::Error) -> Self {
        StudyError::Store(anyhow::Error::new(err))
    }
}
