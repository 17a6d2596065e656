//! Persistence ledger
//!
//! Each team is seeded with a secret token simulating a red-team foothold.
//! Redeeming the token scores once per (team, round): the token is checked
//! first, then the hit is written with an atomic insert-if-absent, so
//! concurrent redemptions in the same round produce exactly one hit.

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, ScoreError};
use crate::round::SharedRoundClock;
use crate::storage::ScoreStorage;
use crate::types::{PersistenceHit, RoundNumber, TeamId};

pub struct PersistenceLedger {
    storage: Arc<dyn ScoreStorage>,
    round: SharedRoundClock,
    tokens: RwLock<HashMap<TeamId, String>>,
}

impl PersistenceLedger {
    pub fn new(storage: Arc<dyn ScoreStorage>, round: SharedRoundClock) -> Self {
        Self {
            storage,
            round,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Load or create the team's token. A stored token always wins over
    /// `configured`, so reseeding never changes a token teams already know.
    pub fn seed_token(&self, team_id: TeamId, configured: Option<&str>) -> Result<String> {
        let token = match self.storage.get_persist_token(team_id)? {
            Some(stored) => stored,
            None => {
                let token = configured
                    .map(str::to_string)
                    .unwrap_or_else(generate_token);
                self.storage.save_persist_token(team_id, &token)?;
                // Lost a race with another seeder: use whatever was stored first.
                self.storage
                    .get_persist_token(team_id)?
                    .unwrap_or(token)
            }
        };
        self.tokens.write().insert(team_id, token.clone());
        Ok(token)
    }

    pub fn token(&self, team_id: TeamId) -> Option<String> {
        self.tokens.read().get(&team_id).cloned()
    }

    /// Team owning a token, if any
    pub fn team_for_token(&self, token: &str) -> Option<TeamId> {
        self.tokens
            .read()
            .iter()
            .find(|(_, t)| t.as_str() == token)
            .map(|(team_id, _)| *team_id)
    }

    /// Redeem a team's token in the current round.
    ///
    /// Returns true if this call scored, false if the round was already scored.
    pub fn redeem(&self, team_id: TeamId, token: &str) -> Result<bool> {
        let valid = self
            .tokens
            .read()
            .get(&team_id)
            .map(|expected| expected == token)
            .unwrap_or(false);
        if !valid {
            warn!("Rejected persistence token for team {}", team_id);
            return Err(ScoreError::InvalidToken(team_id));
        }

        let round = self.round.current();
        let hit = PersistenceHit {
            team_id,
            round,
            redeemed_at: Utc::now(),
        };
        let scored = self.storage.insert_persist_hit(&hit)?;
        if scored {
            info!("Persistence hit for team {} in round {}", team_id, round);
        } else {
            debug!(
                "Persistence for team {} already scored in round {}",
                team_id, round
            );
        }
        Ok(scored)
    }

    /// Rounds with a persistence hit, per team
    pub fn hits_by_team(&self) -> Result<BTreeMap<TeamId, Vec<RoundNumber>>> {
        let mut hits: BTreeMap<TeamId, Vec<RoundNumber>> = BTreeMap::new();
        for hit in self.storage.persist_hits()? {
            hits.entry(hit.team_id).or_default().push(hit.round);
        }
        Ok(hits)
    }
}

fn generate_token() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}
