//! Round counter for the scoring engine
//!
//! The round in effect is the one the Scheduler is currently scoring. It is
//! advanced exactly once per completed cycle, after every (team, check) pair
//! has been attempted, so readers can treat a change of value as "the
//! previous round is closed".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::storage::{Result, ScoreStorage};
use crate::types::RoundNumber;

/// Metadata key holding the round in effect
pub const ROUND_META_KEY: &str = "round";

/// First round of a fresh competition
pub const FIRST_ROUND: RoundNumber = 1;

/// Process-wide round counter
#[derive(Debug)]
pub struct RoundClock {
    current: AtomicU64,
}

impl Default for RoundClock {
    fn default() -> Self {
        Self::new(FIRST_ROUND)
    }
}

impl RoundClock {
    pub fn new(start: RoundNumber) -> Self {
        Self {
            current: AtomicU64::new(start.max(FIRST_ROUND)),
        }
    }

    /// Resume from the persisted round, or start at round 1
    pub fn restore(storage: &dyn ScoreStorage) -> Result<Self> {
        let start = match storage.get_meta(ROUND_META_KEY)? {
            Some(raw) => match raw.parse::<RoundNumber>() {
                Ok(round) => round,
                Err(_) => {
                    warn!("Ignoring unparsable persisted round {:?}", raw);
                    FIRST_ROUND
                }
            },
            None => FIRST_ROUND,
        };
        info!("Round clock starting at round {}", start);
        Ok(Self::new(start))
    }

    /// Round currently in effect
    pub fn current(&self) -> RoundNumber {
        self.current.load(Ordering::SeqCst)
    }

    /// Close the current round. Called by the Scheduler only.
    ///
    /// Returns the new round in effect.
    pub fn advance(&self) -> RoundNumber {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Persist the round in effect so a restart continues from it
    pub fn persist(&self, storage: &dyn ScoreStorage) -> Result<()> {
        storage.set_meta(ROUND_META_KEY, &self.current().to_string())
    }
}

pub type SharedRoundClock = Arc<RoundClock>;
