//! Round scheduler
//!
//! Runs scoring rounds forever:
//! 1. Every (team, check) pair is checked concurrently. A pending rotation
//!    request or the rotation policy swaps the credential before the check.
//! 2. Each check is bounded by the check timeout. A timeout is recorded as
//!    `error`, an unreachable service as `down`.
//! 3. Each outcome is written through the ResultStore on the blocking pool.
//!    A failed write is logged and dropped, the round carries on.
//! 4. Once every pair has been attempted the round clock advances and the
//!    next round starts after `delay + random(0..=jitter)` seconds.

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checker::Checker;
use crate::config::{
    EngineConfig, DEFAULT_CHECK_TIMEOUT_SECS, DEFAULT_DELAY_SECS, DEFAULT_JITTER_SECS,
};
use crate::credentials::{CredentialTable, RotationPolicy};
use crate::error::{Result, ScoreError};
use crate::results::ResultStore;
use crate::round::SharedRoundClock;
use crate::storage::ScoreStorage;
use crate::types::{CheckOutcome, CheckSpec, CheckStatus, Credential, ResultEntry, RoundNumber, Team};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base delay between rounds in seconds
    pub delay_secs: u64,
    /// Upper bound of the random delay added to each pause, in seconds
    pub jitter_secs: u64,
    /// Per-check timeout in seconds
    pub check_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delay_secs: DEFAULT_DELAY_SECS,
            jitter_secs: DEFAULT_JITTER_SECS,
            check_timeout_secs: DEFAULT_CHECK_TIMEOUT_SECS,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            delay_secs: config.delay,
            jitter_secs: config.jitter,
            check_timeout_secs: config.check_timeout,
        }
    }
}

impl SchedulerConfig {
    /// Pause before the next round
    pub fn next_delay(&self) -> Duration {
        let jitter = if self.jitter_secs == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_secs)
        };
        Duration::from_secs(self.delay_secs + jitter)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs.max(1))
    }
}

/// Components a scheduler scores against
#[derive(Clone)]
pub struct RoundContext {
    pub teams: Arc<Vec<Team>>,
    pub results: Arc<ResultStore>,
    pub credentials: Arc<CredentialTable>,
    pub rotation: Arc<dyn RotationPolicy>,
    pub round: SharedRoundClock,
    pub storage: Arc<dyn ScoreStorage>,
}

/// Tally of one completed round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub round: RoundNumber,
    pub up: usize,
    pub down: usize,
    pub errors: usize,
    /// Results lost to storage failures
    pub dropped: usize,
    /// Credentials rotated before checking
    pub rotated: usize,
}

struct PairReport {
    status: CheckStatus,
    stored: bool,
    rotated: bool,
}

pub struct ScoreScheduler {
    config: SchedulerConfig,
    context: RoundContext,
    checker: Arc<dyn Checker>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle returned by spawn_scheduler for graceful shutdown
pub struct SchedulerHandle {
    pub task_handle: tokio::task::JoinHandle<()>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Signal the scheduler to stop after the round in progress
    pub fn shutdown(&self) {
        if let Err(e) = self.shutdown_tx.send(true) {
            warn!("Failed to send shutdown signal to scheduler: {}", e);
        }
    }
}

impl ScoreScheduler {
    pub fn new(
        config: SchedulerConfig,
        context: RoundContext,
        checker: Arc<dyn Checker>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            context,
            checker,
            shutdown_rx,
        }
    }

    /// Run rounds until a shutdown signal arrives
    pub async fn start(mut self) {
        info!(
            "Starting scoring scheduler ({} teams, delay {}s, jitter {}s, timeout {}s)",
            self.context.teams.len(),
            self.config.delay_secs,
            self.config.jitter_secs,
            self.config.check_timeout_secs
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.run_round().await;

            let delay = self.config.next_delay();
            debug!("Next round in {}s", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scoring scheduler received shutdown signal, stopping gracefully");
    }

    /// Score every (team, check) pair once, then close the round
    pub async fn run_round(&self) -> RoundSummary {
        let round = self.context.round.current();
        info!("Starting round {}", round);

        let pairs = self.context.teams.iter().flat_map(|team| {
            team.checks
                .iter()
                .map(move |check| self.score_pair(team, check, round))
        });
        let reports = join_all(pairs).await;

        let mut summary = RoundSummary {
            round,
            ..Default::default()
        };
        for report in reports {
            match report.status {
                CheckStatus::Up => summary.up += 1,
                CheckStatus::Down => summary.down += 1,
                CheckStatus::Error => summary.errors += 1,
            }
            if !report.stored {
                summary.dropped += 1;
            }
            if report.rotated {
                summary.rotated += 1;
            }
        }

        let next = self.context.round.advance();
        if let Err(e) = self.context.round.persist(self.context.storage.as_ref()) {
            error!("Failed to persist round {}: {}", next, e);
        }

        info!(
            "Round {} finished: {} up, {} down, {} error ({} dropped, {} rotated)",
            round, summary.up, summary.down, summary.errors, summary.dropped, summary.rotated
        );
        summary
    }

    async fn score_pair(&self, team: &Team, check: &CheckSpec, round: RoundNumber) -> PairReport {
        let (outcome, generation, rotated) = match self.credential_for(team, check, round) {
            Ok((credential, rotated)) => {
                let outcome = self.run_check(team, check, &credential).await;
                (outcome, Some(credential.generation), rotated)
            }
            Err(e) => {
                warn!(
                    "No credential for team {} check {}: {}",
                    team.id, check.name, e
                );
                (CheckOutcome::error(e.to_string()), None, false)
            }
        };

        let entry = ResultEntry {
            team_id: team.id,
            check: check.name.clone(),
            round,
            status: outcome.status,
            timestamp: Utc::now(),
            latency_ms: outcome.latency_ms,
            metadata: serde_json::json!({
                "generation": generation,
                "detail": outcome.detail,
            }),
        };

        let results = self.context.results.clone();
        let stored = match tokio::task::spawn_blocking(move || results.record(&entry)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(
                    "Dropping result for team {} check {} round {}: {}",
                    team.id, check.name, round, e
                );
                false
            }
            Err(e) => {
                error!(
                    "Result writer for team {} check {} round {} panicked: {}",
                    team.id, check.name, round, e
                );
                false
            }
        };

        PairReport {
            status: outcome.status,
            stored,
            rotated,
        }
    }

    /// Current credential, rotated first when requested or due.
    /// A policy rotation happens at most once per round, even when the round
    /// is re-run after a restart.
    fn credential_for(
        &self,
        team: &Team,
        check: &CheckSpec,
        round: RoundNumber,
    ) -> Result<(Credential, bool)> {
        let credentials = &self.context.credentials;
        let rotated = if credentials.take_rotation_request(team.id, &check.name) {
            Some(credentials.rotate(team.id, &check.name)?)
        } else if self.context.rotation.should_rotate(team.id, &check.name, round) {
            credentials.rotate_for_round(team.id, &check.name, round)?
        } else {
            None
        };

        let Some(credential) = rotated else {
            return Ok((credentials.get(team.id, &check.name)?, false));
        };
        if let Err(e) = self
            .context
            .storage
            .save_credential(team.id, &check.name, &credential)
        {
            error!(
                "Failed to persist rotated credential for team {} check {}: {}",
                team.id, check.name, e
            );
        }
        Ok((credential, true))
    }

    async fn run_check(
        &self,
        team: &Team,
        check: &CheckSpec,
        credential: &Credential,
    ) -> CheckOutcome {
        let timeout = self.config.check_timeout();
        match tokio::time::timeout(timeout, self.checker.check(team, check, credential)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(ScoreError::TransientCheckFailure(detail))) => {
                debug!("Team {} check {} down: {}", team.id, check.name, detail);
                CheckOutcome::down(detail)
            }
            Ok(Err(e)) => CheckOutcome::error(e.to_string()),
            Err(_) => {
                debug!(
                    "Team {} check {} timed out after {}s",
                    team.id,
                    check.name,
                    timeout.as_secs()
                );
                CheckOutcome::error(format!("timed out after {}s", timeout.as_secs()))
            }
        }
    }
}

/// Spawn the scheduler on the current runtime.
/// Returns a SchedulerHandle for graceful shutdown control
pub fn spawn_scheduler(
    config: SchedulerConfig,
    context: RoundContext,
    checker: Arc<dyn Checker>,
) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = ScoreScheduler::new(config, context, checker, shutdown_rx);
    let task_handle = tokio::spawn(scheduler.start());

    SchedulerHandle {
        task_handle,
        shutdown_tx,
    }
}
