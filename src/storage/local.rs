//! Local SQLite storage for the scoring engine
//!
//! Holds everything the engine needs to survive a restart:
//! - Team identities (seeded once)
//! - Check results and SLA counters
//! - Current credentials and persistence tokens
//! - Persistence hits
//! - Injects and their submissions
//!
//! A single connection sits behind a mutex, so every method below is atomic
//! with respect to every other.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::traits::{Result, ScoreStorage, StorageError};
use crate::types::{
    Credential, GradeDecision, Inject, InjectSubmission, NewInject, NewSubmission,
    PersistenceHit, ResultEntry, RoundNumber, SlaRecord, SlaUpdate, SubmissionState, TeamData,
    TeamId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    team_id INTEGER NOT NULL,
    check_name TEXT NOT NULL,
    round INTEGER NOT NULL,
    status TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (team_id, check_name, round)
);

CREATE INDEX IF NOT EXISTS idx_results_round ON results(round);

CREATE TABLE IF NOT EXISTS sla (
    team_id INTEGER NOT NULL,
    check_name TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    violations INTEGER NOT NULL,
    last_round INTEGER NOT NULL,
    PRIMARY KEY (team_id, check_name)
);

CREATE TABLE IF NOT EXISTS credentials (
    team_id INTEGER NOT NULL,
    check_name TEXT NOT NULL,
    username TEXT NOT NULL,
    secret TEXT NOT NULL,
    generation INTEGER NOT NULL,
    rotated_at TEXT NOT NULL,
    rotated_round INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (team_id, check_name)
);

CREATE TABLE IF NOT EXISTS persist_tokens (
    team_id INTEGER PRIMARY KEY,
    token TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS persist_hits (
    team_id INTEGER NOT NULL,
    round INTEGER NOT NULL,
    redeemed_at TEXT NOT NULL,
    PRIMARY KEY (team_id, round)
);

CREATE TABLE IF NOT EXISTS injects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    deadline TEXT
);

CREATE TABLE IF NOT EXISTS inject_submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    inject_id INTEGER NOT NULL REFERENCES injects(id),
    team_id INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    artifact TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    state TEXT NOT NULL,
    grader TEXT,
    score INTEGER,
    feedback TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_inject_team
    ON inject_submissions(inject_id, team_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_submissions_one_pending
    ON inject_submissions(inject_id, team_id) WHERE state = 'submitted';

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SUBMISSION_COLUMNS: &str = "id, inject_id, team_id, attempt, artifact, submitted_at, state, grader, score, feedback, updated_at";

const RESULT_COLUMNS: &str =
    "team_id, check_name, round, status, timestamp, latency_ms, metadata";

pub struct LocalStorage {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStorage {
    /// Open (or create) storage at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Database(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Score storage initialized at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_column<T: FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultEntry> {
    Ok(ResultEntry {
        team_id: row.get(0)?,
        check: row.get(1)?,
        round: row.get::<_, i64>(2)? as RoundNumber,
        status: parse_column(3, row.get(3)?)?,
        timestamp: row.get(4)?,
        latency_ms: row.get::<_, i64>(5)? as u64,
        metadata: parse_metadata(6, row.get(6)?)?,
    })
}

fn parse_metadata(idx: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn sla_from_row(row: &Row<'_>) -> rusqlite::Result<SlaRecord> {
    Ok(SlaRecord {
        team_id: row.get(0)?,
        check: row.get(1)?,
        consecutive_failures: row.get(2)?,
        violations: row.get(3)?,
        last_round: row.get::<_, i64>(4)? as RoundNumber,
    })
}

const SLA_QUERY: &str = "SELECT team_id, check_name, consecutive_failures, violations, last_round
     FROM sla WHERE team_id = ?1 AND check_name = ?2";

fn inject_from_row(row: &Row<'_>) -> rusqlite::Result<Inject> {
    Ok(Inject {
        id: row.get(0)?,
        time: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        deadline: row.get(4)?,
    })
}

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<InjectSubmission> {
    Ok(InjectSubmission {
        id: row.get(0)?,
        inject_id: row.get(1)?,
        team_id: row.get(2)?,
        attempt: row.get(3)?,
        artifact: row.get(4)?,
        submitted_at: row.get(5)?,
        state: parse_column(6, row.get(6)?)?,
        grader: row.get(7)?,
        score: row.get(8)?,
        feedback: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl ScoreStorage for LocalStorage {
    // ========================================================================
    // TEAMS
    // ========================================================================

    fn seed_team(&self, team: &TeamData) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO teams (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![team.id, team.name],
        )?;
        Ok(inserted == 1)
    }

    fn list_teams(&self) -> Result<Vec<TeamData>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM teams ORDER BY id ASC")?;
        let teams = stmt
            .query_map([], |row| {
                Ok(TeamData {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(teams)
    }

    // ========================================================================
    // RESULTS
    // ========================================================================

    fn record_result(
        &self,
        entry: &ResultEntry,
        sla_threshold: u32,
    ) -> Result<Option<SlaUpdate>> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO results (team_id, check_name, round, status, timestamp, latency_ms, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(team_id, check_name, round) DO NOTHING",
            params![
                entry.team_id,
                entry.check,
                entry.round as i64,
                entry.status.as_str(),
                entry.timestamp,
                entry.latency_ms as i64,
                metadata,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }

        let mut sla = tx
            .query_row(SLA_QUERY, params![entry.team_id, entry.check], sla_from_row)
            .optional()?
            .unwrap_or_else(|| SlaRecord::new(entry.team_id, &entry.check));
        let new_violation = sla.apply(entry.status, entry.round, sla_threshold);

        tx.execute(
            "INSERT INTO sla (team_id, check_name, consecutive_failures, violations, last_round)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(team_id, check_name) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                violations = excluded.violations,
                last_round = excluded.last_round",
            params![
                sla.team_id,
                sla.check,
                sla.consecutive_failures,
                sla.violations,
                sla.last_round as i64
            ],
        )?;
        tx.commit()?;

        Ok(Some(SlaUpdate { sla, new_violation }))
    }

    fn get_result(
        &self,
        team_id: TeamId,
        check: &str,
        round: RoundNumber,
    ) -> Result<Option<ResultEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM results WHERE team_id = ?1 AND check_name = ?2 AND round = ?3",
                    RESULT_COLUMNS
                ),
                params![team_id, check, round as i64],
                result_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn results_for_team(&self, team_id: TeamId) -> Result<Vec<ResultEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM results WHERE team_id = ?1 ORDER BY round ASC, check_name ASC",
            RESULT_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![team_id], result_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn result_counts(&self, team_id: TeamId, check: &str) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let (up, total): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0), COUNT(*)
             FROM results WHERE team_id = ?1 AND check_name = ?2",
            params![team_id, check],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((up as u64, total as u64))
    }

    // ========================================================================
    // SLA
    // ========================================================================

    fn get_sla(&self, team_id: TeamId, check: &str) -> Result<Option<SlaRecord>> {
        let conn = self.conn.lock();
        let sla = conn
            .query_row(SLA_QUERY, params![team_id, check], sla_from_row)
            .optional()?;
        Ok(sla)
    }

    // ========================================================================
    // CREDENTIALS
    // ========================================================================

    fn save_credential(
        &self,
        team_id: TeamId,
        check: &str,
        credential: &Credential,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO credentials (team_id, check_name, username, secret, generation, rotated_at, rotated_round)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(team_id, check_name) DO UPDATE SET
                username = excluded.username,
                secret = excluded.secret,
                generation = excluded.generation,
                rotated_at = excluded.rotated_at,
                rotated_round = excluded.rotated_round
             WHERE excluded.generation > credentials.generation",
            params![
                team_id,
                check,
                credential.username,
                credential.secret,
                credential.generation as i64,
                credential.rotated_at,
                credential.rotated_round as i64
            ],
        )?;
        Ok(changed == 1)
    }

    fn load_credentials(&self) -> Result<Vec<(TeamId, String, Credential)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT team_id, check_name, username, secret, generation, rotated_at, rotated_round
             FROM credentials ORDER BY team_id ASC, check_name ASC",
        )?;
        let credentials = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    Credential {
                        username: row.get(2)?,
                        secret: row.get(3)?,
                        generation: row.get::<_, i64>(4)? as u64,
                        rotated_at: row.get(5)?,
                        rotated_round: row.get::<_, i64>(6)? as RoundNumber,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(credentials)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    fn save_persist_token(&self, team_id: TeamId, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO persist_tokens (team_id, token) VALUES (?1, ?2)
             ON CONFLICT(team_id) DO NOTHING",
            params![team_id, token],
        )?;
        Ok(inserted == 1)
    }

    fn get_persist_token(&self, team_id: TeamId) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let token = conn
            .query_row(
                "SELECT token FROM persist_tokens WHERE team_id = ?1",
                params![team_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }

    fn insert_persist_hit(&self, hit: &PersistenceHit) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO persist_hits (team_id, round, redeemed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(team_id, round) DO NOTHING",
            params![hit.team_id, hit.round as i64, hit.redeemed_at],
        )?;
        Ok(inserted == 1)
    }

    fn persist_hits(&self) -> Result<Vec<PersistenceHit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT team_id, round, redeemed_at FROM persist_hits ORDER BY team_id ASC, round ASC",
        )?;
        let hits = stmt
            .query_map([], |row| {
                Ok(PersistenceHit {
                    team_id: row.get(0)?,
                    round: row.get::<_, i64>(1)? as RoundNumber,
                    redeemed_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }

    // ========================================================================
    // INJECTS
    // ========================================================================

    fn create_inject(&self, inject: &NewInject) -> Result<Inject> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO injects (time, title, body, deadline) VALUES (?1, ?2, ?3, ?4)",
            params![inject.time, inject.title, inject.body, inject.deadline],
        )?;
        Ok(Inject {
            id: conn.last_insert_rowid(),
            time: inject.time,
            title: inject.title.clone(),
            body: inject.body.clone(),
            deadline: inject.deadline,
        })
    }

    fn get_inject(&self, id: i64) -> Result<Option<Inject>> {
        let conn = self.conn.lock();
        let inject = conn
            .query_row(
                "SELECT id, time, title, body, deadline FROM injects WHERE id = ?1",
                params![id],
                inject_from_row,
            )
            .optional()?;
        Ok(inject)
    }

    fn list_injects(&self) -> Result<Vec<Inject>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, time, title, body, deadline FROM injects ORDER BY time ASC, id ASC",
        )?;
        let injects = stmt
            .query_map([], inject_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(injects)
    }

    fn insert_submission_unless_pending(
        &self,
        submission: &NewSubmission,
    ) -> Result<Option<InjectSubmission>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let (pending, attempts): (i64, i64) = tx.query_row(
            "SELECT COALESCE(SUM(CASE WHEN state = 'submitted' THEN 1 ELSE 0 END), 0), COUNT(*)
             FROM inject_submissions WHERE inject_id = ?1 AND team_id = ?2",
            params![submission.inject_id, submission.team_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if pending > 0 {
            return Ok(None);
        }

        let attempt = attempts as u32 + 1;
        tx.execute(
            "INSERT INTO inject_submissions (inject_id, team_id, attempt, artifact, submitted_at, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
            params![
                submission.inject_id,
                submission.team_id,
                attempt,
                submission.artifact,
                submission.submitted_at,
                SubmissionState::Submitted.as_str()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Some(InjectSubmission {
            id,
            inject_id: submission.inject_id,
            team_id: submission.team_id,
            attempt,
            artifact: submission.artifact.clone(),
            submitted_at: submission.submitted_at,
            state: SubmissionState::Submitted,
            grader: None,
            score: None,
            feedback: None,
            updated_at: submission.submitted_at,
        }))
    }

    fn transition_submission(
        &self,
        id: i64,
        from: SubmissionState,
        to: SubmissionState,
        decision: &GradeDecision,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE inject_submissions
             SET state = ?3, grader = ?4, score = ?5, feedback = ?6, updated_at = ?7
             WHERE id = ?1 AND state = ?2",
            params![
                id,
                from.as_str(),
                to.as_str(),
                decision.grader,
                decision.score,
                decision.feedback,
                decision.decided_at
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_submission(&self, id: i64) -> Result<Option<InjectSubmission>> {
        let conn = self.conn.lock();
        let submission = conn
            .query_row(
                &format!(
                    "SELECT {} FROM inject_submissions WHERE id = ?1",
                    SUBMISSION_COLUMNS
                ),
                params![id],
                submission_from_row,
            )
            .optional()?;
        Ok(submission)
    }

    fn submissions_for_inject(&self, inject_id: i64) -> Result<Vec<InjectSubmission>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM inject_submissions WHERE inject_id = ?1 ORDER BY submitted_at ASC, id ASC",
            SUBMISSION_COLUMNS
        ))?;
        let submissions = stmt
            .query_map(params![inject_id], submission_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(submissions)
    }

    fn latest_submission(
        &self,
        inject_id: i64,
        team_id: TeamId,
    ) -> Result<Option<InjectSubmission>> {
        let conn = self.conn.lock();
        let submission = conn
            .query_row(
                &format!(
                    "SELECT {} FROM inject_submissions WHERE inject_id = ?1 AND team_id = ?2
                     ORDER BY attempt DESC LIMIT 1",
                    SUBMISSION_COLUMNS
                ),
                params![inject_id, team_id],
                submission_from_row,
            )
            .optional()?;
        Ok(submission)
    }

    // ========================================================================
    // METADATA
    // ========================================================================

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
