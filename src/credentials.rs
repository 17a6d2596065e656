//! Credential table and rotation policy
//!
//! Holds exactly one live credential per (team, check). A single mutex
//! covers the whole table: reads, rotations and rotation requests are all
//! mutually exclusive, so a `get` after `rotate` always sees the new secret.
//!
//! Rotation cadence is pluggable through [`RotationPolicy`]. On-demand
//! rotations are queued with [`CredentialTable::request_rotation`] and honoured
//! by the Scheduler on its next cycle.

use chrono::Utc;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, ScoreError};
use crate::types::{Credential, RoundNumber, TeamId};

/// Length of generated secrets
pub const SECRET_LENGTH: usize = 16;

type CredentialKey = (TeamId, String);

#[derive(Default)]
struct TableInner {
    entries: HashMap<CredentialKey, Credential>,
    rotation_requests: HashSet<CredentialKey>,
}

/// Thread-safe table of current credentials
#[derive(Default)]
pub struct CredentialTable {
    inner: Mutex<TableInner>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a credential (seeding or restore). Replaces any existing entry.
    pub fn insert(&self, team_id: TeamId, check: &str, credential: Credential) {
        self.inner
            .lock()
            .entries
            .insert((team_id, check.to_string()), credential);
    }

    /// Current credential for a pair
    pub fn get(&self, team_id: TeamId, check: &str) -> Result<Credential> {
        self.inner
            .lock()
            .entries
            .get(&(team_id, check.to_string()))
            .cloned()
            .ok_or_else(|| not_found(team_id, check))
    }

    /// Replace the credential with a freshly generated secret and return it
    pub fn rotate(&self, team_id: TeamId, check: &str) -> Result<Credential> {
        let secret = generate_secret(SECRET_LENGTH);
        let mut inner = self.inner.lock();
        let key = (team_id, check.to_string());
        let current = inner
            .entries
            .get_mut(&key)
            .ok_or_else(|| not_found(team_id, check))?;

        current.secret = secret;
        current.generation += 1;
        current.rotated_at = Utc::now();
        let rotated = current.clone();
        inner.rotation_requests.remove(&key);

        info!(
            "Rotated credential for team {} check {} (generation {})",
            team_id, check, rotated.generation
        );
        Ok(rotated)
    }

    /// Policy-driven rotation for `round`.
    ///
    /// Returns `None` when the pair was already rotated in this round, which
    /// happens when a round is re-run after a restart.
    pub fn rotate_for_round(
        &self,
        team_id: TeamId,
        check: &str,
        round: RoundNumber,
    ) -> Result<Option<Credential>> {
        let secret = generate_secret(SECRET_LENGTH);
        let mut inner = self.inner.lock();
        let key = (team_id, check.to_string());
        let current = inner
            .entries
            .get_mut(&key)
            .ok_or_else(|| not_found(team_id, check))?;

        if current.rotated_round >= round {
            debug!(
                "Credential for team {} check {} already rotated in round {}",
                team_id, check, current.rotated_round
            );
            return Ok(None);
        }

        current.secret = secret;
        current.generation += 1;
        current.rotated_at = Utc::now();
        current.rotated_round = round;
        let rotated = current.clone();
        inner.rotation_requests.remove(&key);

        info!(
            "Rotated credential for team {} check {} in round {} (generation {})",
            team_id, check, round, rotated.generation
        );
        Ok(Some(rotated))
    }

    /// Install a team-chosen secret (password change request)
    pub fn change_secret(&self, team_id: TeamId, check: &str, secret: &str) -> Result<Credential> {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get_mut(&(team_id, check.to_string()))
            .ok_or_else(|| not_found(team_id, check))?;

        current.secret = secret.to_string();
        current.generation += 1;
        current.rotated_at = Utc::now();
        let changed = current.clone();

        info!(
            "Password change applied for team {} check {} (generation {})",
            team_id, check, changed.generation
        );
        Ok(changed)
    }

    /// Queue a rotation for the Scheduler's next cycle
    pub fn request_rotation(&self, team_id: TeamId, check: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (team_id, check.to_string());
        if !inner.entries.contains_key(&key) {
            return Err(not_found(team_id, check));
        }
        if inner.rotation_requests.insert(key) {
            debug!("Rotation requested for team {} check {}", team_id, check);
        }
        Ok(())
    }

    /// Consume a pending rotation request. Returns true if one was queued.
    pub fn take_rotation_request(&self, team_id: TeamId, check: &str) -> bool {
        self.inner
            .lock()
            .rotation_requests
            .remove(&(team_id, check.to_string()))
    }

    /// All current credentials for a team, ordered by check name
    pub fn team_credentials(&self, team_id: TeamId) -> Vec<(String, Credential)> {
        let inner = self.inner.lock();
        let mut credentials: Vec<_> = inner
            .entries
            .iter()
            .filter(|((team, _), _)| *team == team_id)
            .map(|((_, check), credential)| (check.clone(), credential.clone()))
            .collect();
        credentials.sort_by(|a, b| a.0.cmp(&b.0));
        credentials
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(team_id: TeamId, check: &str) -> ScoreError {
    ScoreError::NotFound(format!("credential for team {} check {}", team_id, check))
}

/// Random alphanumeric secret
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// ============================================================================
// Rotation policy
// ============================================================================

/// Decides whether a pair's credential rotates at the start of its check
pub trait RotationPolicy: Send + Sync {
    fn should_rotate(&self, team_id: TeamId, check: &str, round: RoundNumber) -> bool;
}

/// Only on-demand rotations
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRotate;

impl RotationPolicy for NeverRotate {
    fn should_rotate(&self, _team_id: TeamId, _check: &str, _round: RoundNumber) -> bool {
        false
    }
}

/// Rotate every `rounds` rounds (on rounds divisible by `rounds`)
#[derive(Debug, Clone, Copy)]
pub struct EveryNRounds {
    rounds: u64,
}

impl EveryNRounds {
    pub fn new(rounds: u64) -> Self {
        Self {
            rounds: rounds.max(1),
        }
    }
}

impl RotationPolicy for EveryNRounds {
    fn should_rotate(&self, _team_id: TeamId, _check: &str, round: RoundNumber) -> bool {
        round % self.rounds == 0
    }
}

/// Policy for a `rotate_every` setting (0 = on demand only)
pub fn policy_for_interval(rounds: u64) -> Arc<dyn RotationPolicy> {
    if rounds == 0 {
        Arc::new(NeverRotate)
    } else {
        Arc::new(EveryNRounds::new(rounds))
    }
}
