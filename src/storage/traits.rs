use crate::types::{
    Credential, GradeDecision, Inject, InjectSubmission, NewInject, NewSubmission,
    PersistenceHit, ResultEntry, RoundNumber, SlaRecord, SlaUpdate, SubmissionState, TeamData,
    TeamId,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable record store used by the scoring engine.
///
/// Every method is atomic on its own. The check-and-set operations
/// (`record_result`, `insert_persist_hit`, `insert_submission_unless_pending`,
/// `transition_submission`) report whether they took effect instead of failing
/// when the guarded condition does not hold.
pub trait ScoreStorage: Send + Sync {
    // ==================== Teams ====================

    /// Insert the team if its id is not yet present. Returns true when inserted.
    fn seed_team(&self, team: &TeamData) -> Result<bool>;
    fn list_teams(&self) -> Result<Vec<TeamData>>;

    // ==================== Results ====================

    /// Insert a result unless one exists for the same (team, check, round),
    /// and fold it into the pair's SLA counters in the same transaction.
    ///
    /// Returns `None` when the triple was already recorded.
    fn record_result(
        &self,
        entry: &ResultEntry,
        sla_threshold: u32,
    ) -> Result<Option<SlaUpdate>>;
    fn get_result(
        &self,
        team_id: TeamId,
        check: &str,
        round: RoundNumber,
    ) -> Result<Option<ResultEntry>>;
    fn results_for_team(&self, team_id: TeamId) -> Result<Vec<ResultEntry>>;
    /// `(up, total)` result counts for a (team, check) pair
    fn result_counts(&self, team_id: TeamId, check: &str) -> Result<(u64, u64)>;

    // ==================== SLA ====================

    fn get_sla(&self, team_id: TeamId, check: &str) -> Result<Option<SlaRecord>>;

    // ==================== Credentials ====================

    /// Upsert a credential unless a newer generation is already stored.
    fn save_credential(&self, team_id: TeamId, check: &str, credential: &Credential)
        -> Result<bool>;
    fn load_credentials(&self) -> Result<Vec<(TeamId, String, Credential)>>;

    // ==================== Persistence ====================

    /// Store the team's token if none is stored yet. Returns true when stored.
    fn save_persist_token(&self, team_id: TeamId, token: &str) -> Result<bool>;
    fn get_persist_token(&self, team_id: TeamId) -> Result<Option<String>>;
    /// Insert a hit unless (team, round) is already recorded.
    fn insert_persist_hit(&self, hit: &PersistenceHit) -> Result<bool>;
    fn persist_hits(&self) -> Result<Vec<PersistenceHit>>;

    // ==================== Injects ====================

    fn create_inject(&self, inject: &NewInject) -> Result<Inject>;
    fn get_inject(&self, id: i64) -> Result<Option<Inject>>;
    fn list_injects(&self) -> Result<Vec<Inject>>;

    /// Insert a `submitted` row unless the team already has one pending for
    /// the inject. Returns `None` when a pending submission blocks the insert.
    fn insert_submission_unless_pending(
        &self,
        submission: &NewSubmission,
    ) -> Result<Option<InjectSubmission>>;
    /// Move a submission from `from` to `to`, applying the decision. Returns
    /// false when the submission is not currently in `from`.
    fn transition_submission(
        &self,
        id: i64,
        from: SubmissionState,
        to: SubmissionState,
        decision: &GradeDecision,
    ) -> Result<bool>;
    fn get_submission(&self, id: i64) -> Result<Option<InjectSubmission>>;
    fn submissions_for_inject(&self, inject_id: i64) -> Result<Vec<InjectSubmission>>;
    fn latest_submission(
        &self,
        inject_id: i64,
        team_id: TeamId,
    ) -> Result<Option<InjectSubmission>>;

    // ==================== Metadata ====================

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
    fn get_meta(&self, key: &str) -> Result<Option<String>>;
}
