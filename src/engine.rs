//! Scoring engine
//!
//! Owns every component and exposes the operations the web layer consumes:
//! round, uptime, credentials and password changes, inject submission and
//! grading, persistence redemption. `bootstrap` performs the idempotent startup seeding against
//! whatever the storage already holds.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::checker::Checker;
use crate::config::EngineConfig;
use crate::credentials::{
    generate_secret, policy_for_interval, CredentialTable, RotationPolicy, SECRET_LENGTH,
};
use crate::error::{Result, ScoreError};
use crate::injects::InjectWorkflow;
use crate::ledger::PersistenceLedger;
use crate::results::ResultStore;
use crate::round::{RoundClock, SharedRoundClock};
use crate::scheduler::{self, RoundContext, SchedulerConfig, SchedulerHandle};
use crate::storage::ScoreStorage;
use crate::types::{
    CheckSpec, Credential, Inject, InjectStatus, InjectSubmission, NewInject, ResultEntry,
    RoundNumber, SlaRecord, Team, TeamId,
};

pub struct ScoringEngine {
    config: EngineConfig,
    teams: Arc<Vec<Team>>,
    storage: Arc<dyn ScoreStorage>,
    round: SharedRoundClock,
    credentials: Arc<CredentialTable>,
    rotation: Arc<dyn RotationPolicy>,
    results: Arc<ResultStore>,
    ledger: PersistenceLedger,
    injects: InjectWorkflow,
}

impl ScoringEngine {
    /// Validate the configuration and bring every component up from storage
    pub fn bootstrap(config: EngineConfig, storage: Arc<dyn ScoreStorage>) -> Result<Self> {
        config.validate()?;
        let teams = config.teams();

        for team in &teams {
            if storage.seed_team(&team.data())? {
                info!("Seeded team {} ({})", team.id, team.name);
            }
        }
        for stored in storage.list_teams()? {
            match teams.iter().find(|t| t.id == stored.id) {
                Some(team) if team.name != stored.name => warn!(
                    "Team {} is stored as {:?} but configured as {:?}",
                    stored.id, stored.name, team.name
                ),
                None => warn!("Stored team {} ({}) is not configured", stored.id, stored.name),
                _ => {}
            }
        }

        let round = Arc::new(RoundClock::restore(storage.as_ref())?);
        let credentials = Arc::new(Self::load_credentials(&teams, storage.as_ref())?);

        let ledger = PersistenceLedger::new(storage.clone(), round.clone());
        if config.persists {
            for team in &teams {
                ledger.seed_token(team.id, team.persist_token.as_deref())?;
            }
        }

        let engine = Self {
            rotation: policy_for_interval(config.rotate_every),
            results: Arc::new(ResultStore::new(storage.clone(), config.sla_threshold)),
            injects: InjectWorkflow::new(storage.clone()),
            teams: Arc::new(teams),
            config,
            storage,
            round,
            credentials,
            ledger,
        };
        info!(
            "Scoring engine ready: {} teams, {} credentials, round {}",
            engine.teams.len(),
            engine.credentials.len(),
            engine.current_round()
        );
        Ok(engine)
    }

    /// Stored credentials win; pairs without one get the configured password
    /// or a generated secret.
    fn load_credentials(teams: &[Team], storage: &dyn ScoreStorage) -> Result<CredentialTable> {
        let mut stored: HashMap<(TeamId, String), Credential> = storage
            .load_credentials()?
            .into_iter()
            .map(|(team_id, check, credential)| ((team_id, check), credential))
            .collect();

        let table = CredentialTable::new();
        for team in teams {
            for check in &team.checks {
                let credential = match stored.remove(&(team.id, check.name.clone())) {
                    Some(credential) => credential,
                    None => {
                        let credential = Credential {
                            username: check.username.clone(),
                            secret: check
                                .password
                                .clone()
                                .unwrap_or_else(|| generate_secret(SECRET_LENGTH)),
                            generation: 0,
                            rotated_at: Utc::now(),
                            rotated_round: 0,
                        };
                        storage.save_credential(team.id, &check.name, &credential)?;
                        credential
                    }
                };
                table.insert(team.id, &check.name, credential);
            }
        }
        Ok(table)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub fn team(&self, team_id: TeamId) -> Result<&Team> {
        self.teams
            .iter()
            .find(|t| t.id == team_id)
            .ok_or_else(|| ScoreError::NotFound(format!("team {}", team_id)))
    }

    fn check(&self, team_id: TeamId, check: &str) -> Result<&CheckSpec> {
        self.team(team_id)?
            .check(check)
            .ok_or_else(|| ScoreError::NotFound(format!("check {} for team {}", check, team_id)))
    }

    // ========================================================================
    // Rounds and results
    // ========================================================================

    pub fn current_round(&self) -> RoundNumber {
        self.round.current()
    }

    /// Uptime percentage for a (team, check) pair over all recorded rounds
    pub fn uptime_for(&self, team_id: TeamId, check: &str) -> Result<f64> {
        self.check(team_id, check)?;
        Ok(self.results.uptime(team_id, check)?.percentage())
    }

    pub fn sla_for(&self, team_id: TeamId, check: &str) -> Result<SlaRecord> {
        self.check(team_id, check)?;
        self.results.sla(team_id, check)
    }

    /// Every result recorded for a team, ordered by round
    pub fn export_team(&self, team_id: TeamId) -> Result<Vec<ResultEntry>> {
        self.team(team_id)?;
        self.results.export_team(team_id)
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub fn current_credential(&self, team_id: TeamId, check: &str) -> Result<Credential> {
        self.credentials.get(team_id, check)
    }

    pub fn team_credentials(&self, team_id: TeamId) -> Result<Vec<(String, Credential)>> {
        self.team(team_id)?;
        Ok(self.credentials.team_credentials(team_id))
    }

    /// Rotate the pair's credential at the start of its next check
    pub fn request_rotation(&self, team_id: TeamId, check: &str) -> Result<()> {
        self.credentials.request_rotation(team_id, check)
    }

    /// Team self-service password change, only with `easy_pcr` enabled.
    /// Otherwise changes go through the password inject and `apply_pcr`.
    pub fn submit_pcr(&self, team_id: TeamId, check: &str, secret: &str) -> Result<Credential> {
        if !self.config.easy_pcr {
            return Err(ScoreError::FeatureDisabled("self-service password changes"));
        }
        self.apply_pcr(team_id, check, secret)
    }

    /// Install a team-chosen secret; the next check uses it
    pub fn apply_pcr(&self, team_id: TeamId, check: &str, secret: &str) -> Result<Credential> {
        self.check(team_id, check)?;
        if secret.is_empty() {
            return Err(ScoreError::InvalidRequest(
                "password change needs a non-empty secret".to_string(),
            ));
        }

        let credential = self.credentials.change_secret(team_id, check, secret)?;
        self.storage.save_credential(team_id, check, &credential)?;
        Ok(credential)
    }

    // ========================================================================
    // Injects
    // ========================================================================

    /// Seed the password-change inject (unless disabled) and `configured`
    /// into an empty inject table
    pub fn seed_injects(&self, configured: Vec<NewInject>) -> Result<usize> {
        let seeded = self
            .injects
            .seed_defaults(!self.config.no_passwords, configured)?;
        if seeded > 0 {
            info!("Seeded {} injects", seeded);
        }
        Ok(seeded)
    }

    pub fn publish_inject(&self, inject: NewInject) -> Result<Inject> {
        self.injects.publish(inject)
    }

    pub fn injects(&self) -> Result<Vec<Inject>> {
        self.injects.injects()
    }

    pub fn submit_inject(
        &self,
        inject_id: i64,
        team_id: TeamId,
        artifact: &str,
    ) -> Result<InjectSubmission> {
        self.team(team_id)?;
        self.injects.submit(inject_id, team_id, artifact)
    }

    pub fn grade_submission(
        &self,
        submission_id: i64,
        grader: &str,
        score: u32,
        feedback: Option<String>,
    ) -> Result<InjectSubmission> {
        self.injects.grade(submission_id, grader, score, feedback)
    }

    pub fn invalidate_submission(
        &self,
        submission_id: i64,
        grader: &str,
        feedback: Option<String>,
    ) -> Result<InjectSubmission> {
        self.injects.invalidate(submission_id, grader, feedback)
    }

    pub fn submissions(&self, inject_id: i64) -> Result<Vec<InjectSubmission>> {
        self.injects.submissions(inject_id)
    }

    pub fn inject_status(&self, inject_id: i64, team_id: TeamId) -> Result<InjectStatus> {
        self.team(team_id)?;
        self.injects.status_for(inject_id, team_id)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Redeem a team's persistence token in the current round.
    ///
    /// Returns true exactly once per (team, round).
    pub fn redeem_persistence(&self, team_id: TeamId, token: &str) -> Result<bool> {
        if !self.config.persists {
            return Err(ScoreError::FeatureDisabled("persistence scoring"));
        }
        self.ledger.redeem(team_id, token)
    }

    /// Redeem by token alone, resolving the owning team
    pub fn redeem_token(&self, token: &str) -> Result<(TeamId, bool)> {
        if !self.config.persists {
            return Err(ScoreError::FeatureDisabled("persistence scoring"));
        }
        let team_id = self
            .ledger
            .team_for_token(token)
            .ok_or_else(|| ScoreError::NotFound("persistence token".to_string()))?;
        Ok((team_id, self.ledger.redeem(team_id, token)?))
    }

    pub fn persistence_token(&self, team_id: TeamId) -> Option<String> {
        self.ledger.token(team_id)
    }

    /// Rounds with a persistence hit, per team
    pub fn persistence_hits(&self) -> Result<BTreeMap<TeamId, Vec<RoundNumber>>> {
        self.ledger.hits_by_team()
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// Components the scheduler writes to
    pub fn round_context(&self) -> RoundContext {
        RoundContext {
            teams: self.teams.clone(),
            results: self.results.clone(),
            credentials: self.credentials.clone(),
            rotation: self.rotation.clone(),
            round: self.round.clone(),
            storage: self.storage.clone(),
        }
    }

    /// Start the score loop on the current runtime
    pub fn spawn_scheduler(&self, checker: Arc<dyn Checker>) -> SchedulerHandle {
        scheduler::spawn_scheduler(
            SchedulerConfig::from(&self.config),
            self.round_context(),
            checker,
        )
    }
}
