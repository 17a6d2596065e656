//! Integration tests for the scoring engine
//!
//! Drives full rounds through `ScoringEngine` with a scripted checker and
//! verifies the round, SLA, persistence and inject guarantees end-to-end.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use scorekeeper::{
    CheckOutcome, CheckSpec, CheckStatus, Checker, Credential, EngineConfig, InjectStatus,
    LocalStorage, NewInject, SchedulerConfig, ScoreError, ScoreScheduler, ScoreStorage,
    ScoringEngine, SubmissionState, Team,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::watch;

// ============================================================================
// TEST HELPERS
// ============================================================================

const CONFIG: &str = r#"
persists = true
sla_threshold = 3

[[team]]
name = "T1"

[[team.check]]
name = "C1"
service = "http"
target = "10.0.1.10"
username = "admin"
password = "changeme"

[[team]]
name = "T2"
persist_token = "tok123"

[[team.check]]
name = "C1"
service = "tcp"
target = "10.0.2.10:22"

[[team]]
name = "T3"

[[team.check]]
name = "C1"
service = "tcp"
target = "10.0.3.10:22"
"#;

/// Checker whose outcome for every check is flipped by the test
struct SwitchChecker {
    up: AtomicBool,
}

impl SwitchChecker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(true),
        })
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Checker for SwitchChecker {
    async fn check(
        &self,
        _team: &Team,
        _check: &CheckSpec,
        _credential: &Credential,
    ) -> scorekeeper::Result<CheckOutcome> {
        if self.up.load(Ordering::SeqCst) {
            Ok(CheckOutcome::up(1))
        } else {
            Err(ScoreError::TransientCheckFailure(
                "connection refused".to_string(),
            ))
        }
    }
}

fn engine(storage: Arc<dyn ScoreStorage>) -> ScoringEngine {
    let config = EngineConfig::from_toml_str(CONFIG).unwrap();
    ScoringEngine::bootstrap(config, storage).unwrap()
}

fn scheduler(engine: &ScoringEngine, checker: Arc<dyn Checker>) -> ScoreScheduler {
    let (_tx, rx) = watch::channel(false);
    let config = SchedulerConfig {
        delay_secs: 0,
        jitter_secs: 0,
        check_timeout_secs: 1,
    };
    ScoreScheduler::new(config, engine.round_context(), checker, rx)
}

fn inject(title: &str) -> NewInject {
    NewInject {
        time: Utc::now(),
        title: title.to_string(),
        body: "Document your firewall rules".to_string(),
        deadline: None,
    }
}

// ============================================================================
// ROUNDS AND SLA
// ============================================================================

#[tokio::test]
async fn test_pass_fail_pass_streak_counts_one_violation() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    let checker = SwitchChecker::new();
    let scheduler = scheduler(&engine, checker.clone());

    for _ in 1..=3 {
        scheduler.run_round().await;
    }
    checker.set_up(false);
    for _ in 4..=6 {
        scheduler.run_round().await;
    }

    let sla = engine.sla_for(1, "C1").unwrap();
    assert_eq!(sla.violations, 1);
    assert_eq!(sla.consecutive_failures, 3);

    checker.set_up(true);
    let summary = scheduler.run_round().await;
    assert_eq!(summary.round, 7);

    let sla = engine.sla_for(1, "C1").unwrap();
    assert_eq!(sla.violations, 1);
    assert_eq!(sla.consecutive_failures, 0);

    assert_eq!(engine.current_round(), 8);
    let uptime = engine.uptime_for(1, "C1").unwrap();
    assert!((uptime - 4.0 / 7.0 * 100.0).abs() < 1e-9);

    let exported = engine.export_team(1).unwrap();
    let rounds: Vec<u64> = exported.iter().map(|e| e.round).collect();
    assert_eq!(rounds, (1..=7).collect::<Vec<_>>());
    assert_eq!(exported[3].status, CheckStatus::Down);
}

#[tokio::test]
async fn test_rotation_request_takes_effect_next_round() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    let scheduler = scheduler(&engine, SwitchChecker::new());

    let before = engine.current_credential(1, "C1").unwrap();
    assert_eq!(before.secret, "changeme");

    engine.request_rotation(1, "C1").unwrap();
    assert_eq!(engine.current_credential(1, "C1").unwrap(), before);

    let summary = scheduler.run_round().await;
    assert_eq!(summary.rotated, 1);

    let after = engine.current_credential(1, "C1").unwrap();
    assert_ne!(after.secret, before.secret);
    assert_eq!(after.generation, before.generation + 1);
    assert_eq!(
        engine.team_credentials(1).unwrap(),
        vec![("C1".to_string(), after)]
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("score.db");

    let rotated = {
        let storage: Arc<dyn ScoreStorage> = Arc::new(LocalStorage::open(&path).unwrap());
        let engine = engine(storage);
        let scheduler = scheduler(&engine, SwitchChecker::new());

        engine.request_rotation(1, "C1").unwrap();
        scheduler.run_round().await;
        scheduler.run_round().await;
        engine.current_credential(1, "C1").unwrap()
    };

    let storage: Arc<dyn ScoreStorage> = Arc::new(LocalStorage::open(&path).unwrap());
    let engine = engine(storage);
    assert_eq!(engine.current_round(), 3);
    assert_eq!(engine.current_credential(1, "C1").unwrap(), rotated);
    assert_eq!(engine.export_team(2).unwrap().len(), 2);
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[test]
fn test_concurrent_redeem_in_round_five() {
    let storage: Arc<dyn ScoreStorage> = Arc::new(LocalStorage::in_memory().unwrap());
    storage.set_meta("round", "5").unwrap();
    let engine = Arc::new(engine(storage));
    assert_eq!(engine.current_round(), 5);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || engine.redeem_persistence(2, "tok123").unwrap())
        })
        .collect();
    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|scored| **scored).count(), 1);
    assert_eq!(engine.persistence_hits().unwrap().get(&2), Some(&vec![5]));
    assert!(!engine.redeem_persistence(2, "tok123").unwrap());
}

#[test]
fn test_wrong_token_is_rejected() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    assert!(matches!(
        engine.redeem_persistence(2, "tok999"),
        Err(ScoreError::InvalidToken(2))
    ));
    assert!(engine.persistence_hits().unwrap().is_empty());
}

// ============================================================================
// INJECTS
// ============================================================================

#[test]
fn test_submit_grade_then_second_grade_conflicts() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    let i1 = engine.publish_inject(inject("I1")).unwrap();
    assert_eq!(engine.inject_status(i1.id, 3).unwrap(), InjectStatus::Published);

    let submission = engine.submit_inject(i1.id, 3, "report.pdf").unwrap();
    assert_eq!(submission.state, SubmissionState::Submitted);
    assert_eq!(engine.inject_status(i1.id, 3).unwrap(), InjectStatus::Submitted);

    let graded = engine
        .grade_submission(submission.id, "white-team", 90, Some("solid".to_string()))
        .unwrap();
    assert_eq!(graded.state, SubmissionState::Graded);
    assert_eq!(graded.score, Some(90));

    let err = engine
        .grade_submission(submission.id, "white-team", 40, None)
        .unwrap_err();
    assert!(matches!(
        err,
        ScoreError::StateConflict {
            actual: SubmissionState::Graded,
            ..
        }
    ));

    let submissions = engine.submissions(i1.id).unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].score, Some(90));
    assert_eq!(engine.inject_status(i1.id, 3).unwrap(), InjectStatus::Graded);
}

#[test]
fn test_invalidate_reopens_submission_window() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    let i1 = engine.publish_inject(inject("I1")).unwrap();

    let first = engine.submit_inject(i1.id, 3, "draft").unwrap();
    let pending = engine.submit_inject(i1.id, 3, "draft-2").unwrap_err();
    assert!(pending.is_conflict());

    engine
        .invalidate_submission(first.id, "white-team", Some("missing rules".to_string()))
        .unwrap();
    assert_eq!(engine.inject_status(i1.id, 3).unwrap(), InjectStatus::Invalid);
    assert!(engine
        .grade_submission(first.id, "white-team", 50, None)
        .unwrap_err()
        .is_conflict());

    let second = engine.submit_inject(i1.id, 3, "final").unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(engine.inject_status(i1.id, 3).unwrap(), InjectStatus::Submitted);
}

#[test]
fn test_submission_after_deadline_is_rejected() {
    let engine = engine(Arc::new(LocalStorage::in_memory().unwrap()));
    let closed = engine
        .publish_inject(NewInject {
            deadline: Some(Utc::now() - ChronoDuration::minutes(5)),
            ..inject("Closed")
        })
        .unwrap();

    assert!(matches!(
        engine.submit_inject(closed.id, 1, "late"),
        Err(ScoreError::DeadlinePassed { .. })
    ));
    assert!(engine.submissions(closed.id).unwrap().is_empty());
}
