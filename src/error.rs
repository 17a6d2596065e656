//! Error taxonomy for the scoring engine
//!
//! - `TransientCheckFailure`: a monitored service could not be reached. Never fatal,
//!   the Scheduler records it as downtime.
//! - `StorageWrite`: the persistence layer rejected a write. Logged, the round continues.
//! - `StateConflict`: an illegal inject workflow transition. No mutation happens.
//! - `InvalidToken`: a persistence redemption with the wrong secret. No mutation happens.
//! - `Configuration`: malformed team/check list. Fatal at startup.

use thiserror::Error;

use crate::storage::StorageError;
use crate::types::{SubmissionState, TeamId};

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Transient check failure: {0}")]
    TransientCheckFailure(String),

    #[error("Storage write failure: {0}")]
    StorageWrite(#[from] StorageError),

    #[error("State conflict on submission {submission_id}: expected {expected}, found {actual}")]
    StateConflict {
        submission_id: i64,
        expected: SubmissionState,
        actual: SubmissionState,
    },

    #[error("Team {team_id} already has a pending submission for inject {inject_id}")]
    PendingSubmission { inject_id: i64, team_id: TeamId },

    #[error("Invalid persistence token for team {0}")]
    InvalidToken(TeamId),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Inject {inject_id} closed for submissions at {deadline}")]
    DeadlinePassed {
        inject_id: i64,
        deadline: chrono::DateTime<chrono::Utc>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} is disabled")]
    FeatureDisabled(&'static str),
}

impl ScoreError {
    /// Whether this error is a rejected workflow transition rather than a failure
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::StateConflict { .. } | Self::PendingSubmission { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScoreError>;
