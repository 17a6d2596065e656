//! Core data types shared by the scoring engine
//!
//! Teams and checks come from configuration and never change at runtime.
//! Everything round-scoped (results, SLA counters, credentials, persistence
//! hits) and the inject workflow records are persisted through `ScoreStorage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable team identity, assigned 1-based in configuration order
pub type TeamId = u32;

/// Process-wide round counter value
pub type RoundNumber = u64;

// ============================================================================
// Teams and checks
// ============================================================================

/// Kind of service test a check performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Plain TCP connect
    Tcp,
    /// HTTP GET with basic auth using the current credential
    Http,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Tcp => write!(f, "tcp"),
            ServiceKind::Http => write!(f, "http"),
        }
    }
}

/// A named, team-scoped monitor definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Check name, unique within a team
    pub name: String,
    /// Service type
    pub service: ServiceKind,
    /// `host:port` of the monitored service
    pub target: String,
    /// Request path for HTTP checks
    #[serde(default)]
    pub path: Option<String>,
    /// Credential identity expected by the service
    #[serde(default)]
    pub username: String,
    /// Initial secret; generated when absent
    #[serde(default)]
    pub password: Option<String>,
}

/// In-memory team, built once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub checks: Vec<CheckSpec>,
    /// Configured persistence token, if any
    pub persist_token: Option<String>,
}

impl Team {
    pub fn check(&self, name: &str) -> Option<&CheckSpec> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn data(&self) -> TeamData {
        TeamData {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// Persisted snapshot of team identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamData {
    pub id: TeamId,
    pub name: String,
}

// ============================================================================
// Check results and SLA
// ============================================================================

/// Outcome status of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
    Error,
}

impl CheckStatus {
    pub fn is_up(self) -> bool {
        matches!(self, CheckStatus::Up)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
            CheckStatus::Error => "error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "down" => Ok(CheckStatus::Down),
            "error" => Ok(CheckStatus::Error),
            other => Err(format!("unknown check status: {}", other)),
        }
    }
}

/// What a checker reports for one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn up(latency_ms: u64) -> Self {
        Self {
            status: CheckStatus::Up,
            latency_ms,
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Down,
            latency_ms: 0,
            detail: Some(detail.into()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            latency_ms: 0,
            detail: Some(detail.into()),
        }
    }
}

/// One outcome per (team, check, round). Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub team_id: TeamId,
    pub check: String,
    pub round: RoundNumber,
    pub status: CheckStatus,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    /// Free-form check metadata (error detail, credential generation, ...)
    pub metadata: serde_json::Value,
}

/// Aggregate SLA counters per (team, check)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaRecord {
    pub team_id: TeamId,
    pub check: String,
    /// Failures since the last `up`
    pub consecutive_failures: u32,
    /// Failure streaks that reached the threshold
    pub violations: u32,
    /// Last round folded into these counters
    pub last_round: RoundNumber,
}

/// SLA counters after a newly stored result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaUpdate {
    pub sla: SlaRecord,
    /// This result's round opened a new violation
    pub new_violation: bool,
}

// ============================================================================
// Credentials
// ============================================================================

/// Live secret for a (team, check) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub secret: String,
    /// Bumped on every rotation
    pub generation: u64,
    pub rotated_at: DateTime<Utc>,
    /// Round of the last scheduled rotation, 0 if never rotated by a round
    #[serde(default)]
    pub rotated_round: RoundNumber,
}

// ============================================================================
// Injects
// ============================================================================

/// A manually graded task published to all teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inject {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub deadline: Option<DateTime<Utc>>,
}

impl Inject {
    /// Whether submissions are accepted at `now`
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) => now <= deadline,
            None => true,
        }
    }
}

/// Inject contents before persistence assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInject {
    pub time: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub deadline: Option<DateTime<Utc>>,
}

/// Lifecycle of a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    /// Awaiting a grade
    Submitted,
    /// Rejected by a grader, no score
    Invalid,
    /// Terminal, score attached
    Graded,
}

impl SubmissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionState::Submitted => "submitted",
            SubmissionState::Invalid => "invalid",
            SubmissionState::Graded => "graded",
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(SubmissionState::Submitted),
            "invalid" => Ok(SubmissionState::Invalid),
            "graded" => Ok(SubmissionState::Graded),
            other => Err(format!("unknown submission state: {}", other)),
        }
    }
}

/// One attempt by a team at an inject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectSubmission {
    pub id: i64,
    pub inject_id: i64,
    pub team_id: TeamId,
    /// 1-based attempt counter per (inject, team)
    pub attempt: u32,
    /// Reference to the submitted artifact (file name, URL, ...)
    pub artifact: String,
    pub submitted_at: DateTime<Utc>,
    pub state: SubmissionState,
    pub grader: Option<String>,
    pub score: Option<u32>,
    pub feedback: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Submission contents before persistence assigns an id and attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub inject_id: i64,
    pub team_id: TeamId,
    pub artifact: String,
    pub submitted_at: DateTime<Utc>,
}

/// Grader decision applied on a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeDecision {
    pub grader: String,
    pub score: Option<u32>,
    pub feedback: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Inject state as seen by one team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectStatus {
    /// No submission yet
    Published,
    Submitted,
    Invalid,
    Graded,
}

impl From<SubmissionState> for InjectStatus {
    fn from(state: SubmissionState) -> Self {
        match state {
            SubmissionState::Submitted => InjectStatus::Submitted,
            SubmissionState::Invalid => InjectStatus::Invalid,
            SubmissionState::Graded => InjectStatus::Graded,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// A round in which a team's persistence token was redeemed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceHit {
    pub team_id: TeamId,
    pub round: RoundNumber,
    pub redeemed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_round_trip_strings() {
        for status in [CheckStatus::Up, CheckStatus::Down, CheckStatus::Error] {
            assert_eq!(status.as_str().parse::<CheckStatus>().unwrap(), status);
        }
        assert!("sideways".parse::<CheckStatus>().is_err());
    }

    #[test]
    fn test_inject_deadline() {
        let now = Utc::now();
        let mut inject = Inject {
            id: 1,
            time: now,
            title: "Firewall audit".to_string(),
            body: "Document your firewall rules".to_string(),
            deadline: None,
        };
        assert!(inject.is_open_at(now + chrono::Duration::days(30)));

        inject.deadline = Some(now + chrono::Duration::minutes(30));
        assert!(inject.is_open_at(now));
        assert!(!inject.is_open_at(now + chrono::Duration::minutes(31)));
    }

    #[test]
    fn test_team_check_lookup() {
        let team = Team {
            id: 1,
            name: "team1".to_string(),
            checks: vec![CheckSpec {
                name: "web".to_string(),
                service: ServiceKind::Http,
                target: "10.1.1.5:80".to_string(),
                path: Some("/login".to_string()),
                username: "admin".to_string(),
                password: None,
            }],
            persist_token: None,
        };
        assert!(team.check("web").is_some());
        assert!(team.check("ssh").is_none());
        assert_eq!(team.data().name, "team1");
    }
}
