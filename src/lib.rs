//! Scoring engine for multi-team cyber-defense exercises
//!
//! Checks every team's services once per round, turns the outcomes into
//! uptime and SLA records, rotates per-service credentials, tracks red-team
//! persistence hits and runs the inject grading workflow.
//!
//! ## Module Structure
//!
//! - `engine`: `ScoringEngine`, bootstrap plus the operations the web layer uses
//! - `scheduler`: the round loop and its shutdown handle
//! - `checker`: service check capability (TCP / HTTP)
//! - `credentials`: credential table and rotation policies
//! - `results`: result ledger, SLA counters, uptime
//! - `ledger`: persistence token redemption
//! - `injects`: inject submission and grading state machine
//! - `round`: process-wide round counter
//! - `storage`: durable record store (SQLite)
//! - `config`: TOML configuration and injects file

pub mod checker;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod injects;
pub mod ledger;
pub mod results;
pub mod round;
pub mod scheduler;
pub mod storage;
pub mod types;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use checker::{Checker, ServiceChecker};
pub use config::{
    load_injects_file, parse_injects, parse_timezone, EngineConfig, InjectTimezone, TeamConfig,
};
pub use credentials::{CredentialTable, EveryNRounds, NeverRotate, RotationPolicy};
pub use engine::ScoringEngine;
pub use error::{Result, ScoreError};
pub use injects::{InjectWorkflow, MAX_SCORE, PASSWORD_INJECT_TITLE};
pub use ledger::PersistenceLedger;
pub use results::{ResultStore, Uptime};
pub use round::{RoundClock, SharedRoundClock};
pub use scheduler::{
    spawn_scheduler, RoundContext, RoundSummary, SchedulerConfig, SchedulerHandle, ScoreScheduler,
};
pub use storage::{LocalStorage, ScoreStorage, StorageError};
pub use types::{
    CheckOutcome, CheckSpec, CheckStatus, Credential, Inject, InjectStatus, InjectSubmission,
    NewInject, PersistenceHit, ResultEntry, RoundNumber, ServiceKind, SlaRecord, SlaUpdate,
    SubmissionState, Team, TeamData, TeamId,
};
