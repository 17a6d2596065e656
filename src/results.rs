//! Check results and SLA counters
//!
//! `record` stores the ResultEntry and folds it into the SLA counters in one
//! storage transaction: either both land or neither does, so an SLA record
//! never reflects a round whose result is not stored. Duplicate writes for the
//! same (team, check, round) are no-ops.
//!
//! A violation is counted when a failure streak reaches the threshold. The
//! rest of that streak does not add further violations.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::ScoreStorage;
use crate::types::{CheckStatus, ResultEntry, RoundNumber, SlaRecord, TeamId};

impl SlaRecord {
    pub fn new(team_id: TeamId, check: &str) -> Self {
        Self {
            team_id,
            check: check.to_string(),
            ..Default::default()
        }
    }

    /// Fold one round's status into the counters.
    ///
    /// Returns true if this round opened a new violation.
    pub fn apply(&mut self, status: CheckStatus, round: RoundNumber, threshold: u32) -> bool {
        self.last_round = round;
        if status.is_up() {
            self.consecutive_failures = 0;
            return false;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures == threshold {
            self.violations += 1;
            return true;
        }
        false
    }
}

/// Uptime figures for one (team, check) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uptime {
    pub up: u64,
    pub total: u64,
}

impl Uptime {
    /// Percentage of recorded rounds that were up, 0.0 when nothing is recorded
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.up as f64 / self.total as f64 * 100.0
    }
}

/// Ledger of check outcomes plus derived SLA state
pub struct ResultStore {
    storage: Arc<dyn ScoreStorage>,
    sla_threshold: u32,
}

impl ResultStore {
    pub fn new(storage: Arc<dyn ScoreStorage>, sla_threshold: u32) -> Self {
        Self {
            storage,
            sla_threshold: sla_threshold.max(1),
        }
    }

    pub fn sla_threshold(&self) -> u32 {
        self.sla_threshold
    }

    /// Record an outcome and update SLA counters.
    ///
    /// Returns false when an entry for the triple already existed.
    pub fn record(&self, entry: &ResultEntry) -> Result<bool> {
        let update = match self.storage.record_result(entry, self.sla_threshold)? {
            Some(update) => update,
            None => {
                debug!(
                    "Result for team {} check {} round {} already recorded",
                    entry.team_id, entry.check, entry.round
                );
                return Ok(false);
            }
        };

        if update.new_violation {
            warn!(
                "SLA violation for team {} check {} at round {} ({} total)",
                entry.team_id, entry.check, entry.round, update.sla.violations
            );
        }
        Ok(true)
    }

    /// SLA counters for a pair, zeroed when nothing has been recorded yet
    pub fn sla(&self, team_id: TeamId, check: &str) -> Result<SlaRecord> {
        Ok(self
            .storage
            .get_sla(team_id, check)?
            .unwrap_or_else(|| SlaRecord::new(team_id, check)))
    }

    /// Uptime computed from stored results
    pub fn uptime(&self, team_id: TeamId, check: &str) -> Result<Uptime> {
        let (up, total) = self.storage.result_counts(team_id, check)?;
        Ok(Uptime { up, total })
    }

    /// Every result for a team, ordered by round
    pub fn export_team(&self, team_id: TeamId) -> Result<Vec<ResultEntry>> {
        Ok(self.storage.results_for_team(team_id)?)
    }

    pub fn result(
        &self,
        team_id: TeamId,
        check: &str,
        round: RoundNumber,
    ) -> Result<Option<ResultEntry>> {
        Ok(self.storage.get_result(team_id, check, round)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoreError;
    use crate::storage::LocalStorage;
    use chrono::Utc;

    fn entry(round: RoundNumber, status: CheckStatus) -> ResultEntry {
        ResultEntry {
            team_id: 1,
            check: "C1".to_string(),
            round,
            status,
            timestamp: Utc::now(),
            latency_ms: 5,
            metadata: serde_json::Value::Null,
        }
    }

    fn store() -> ResultStore {
        ResultStore::new(Arc::new(LocalStorage::in_memory().unwrap()), 3)
    }

    #[test]
    fn test_null_metadata_entry_is_recorded() {
        let store = store();
        let bare = entry(1, CheckStatus::Down);
        assert!(bare.metadata.is_null());

        assert!(store.record(&bare).unwrap());
        assert!(!store.record(&bare).unwrap());
        assert_eq!(store.uptime(1, "C1").unwrap(), Uptime { up: 0, total: 1 });
        assert_eq!(store.sla(1, "C1").unwrap().consecutive_failures, 1);
    }

    #[test]
    fn test_failed_sla_write_keeps_streak_intact() {
        let local = Arc::new(LocalStorage::in_memory().unwrap());
        let store = ResultStore::new(local.clone(), 3);
        local
            .execute_batch(
                "CREATE TRIGGER reject_round_two_insert BEFORE INSERT ON sla
                 WHEN NEW.last_round = 2
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;
                 CREATE TRIGGER reject_round_two_update BEFORE UPDATE ON sla
                 WHEN NEW.last_round = 2
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();

        assert!(store.record(&entry(1, CheckStatus::Down)).unwrap());
        assert!(matches!(
            store.record(&entry(2, CheckStatus::Down)),
            Err(ScoreError::StorageWrite(_))
        ));
        assert!(store.result(1, "C1", 2).unwrap().is_none());

        local
            .execute_batch(
                "DROP TRIGGER reject_round_two_insert; DROP TRIGGER reject_round_two_update;",
            )
            .unwrap();
        assert!(store.record(&entry(2, CheckStatus::Down)).unwrap());
        assert!(store.record(&entry(3, CheckStatus::Down)).unwrap());

        let sla = store.sla(1, "C1").unwrap();
        assert_eq!(sla.consecutive_failures, 3);
        assert_eq!(sla.violations, 1);
        assert_eq!(store.uptime(1, "C1").unwrap().total, 3);
    }

    #[test]
    fn test_sla_counts_streaks_not_rounds() {
        let mut sla = SlaRecord::new(1, "C1");
        let statuses = [
            CheckStatus::Down,
            CheckStatus::Down,
            CheckStatus::Down,
            CheckStatus::Down,
            CheckStatus::Error,
            CheckStatus::Up,
            CheckStatus::Down,
            CheckStatus::Down,
        ];
        for (i, status) in statuses.into_iter().enumerate() {
            sla.apply(status, i as u64 + 1, 3);
        }
        assert_eq!(sla.violations, 1);
        assert_eq!(sla.consecutive_failures, 2);
        assert_eq!(sla.last_round, 8);

        sla.apply(CheckStatus::Down, 9, 3);
        assert_eq!(sla.violations, 2);
    }

    #[test]
    fn test_pass_fail_pass_scenario() {
        let store = store();
        for round in 1..=3 {
            assert!(store.record(&entry(round, CheckStatus::Up)).unwrap());
        }
        for round in 4..=6 {
            assert!(store.record(&entry(round, CheckStatus::Down)).unwrap());
        }

        let sla = store.sla(1, "C1").unwrap();
        assert_eq!(sla.violations, 1);
        assert_eq!(sla.consecutive_failures, 3);

        store.record(&entry(7, CheckStatus::Up)).unwrap();
        let sla = store.sla(1, "C1").unwrap();
        assert_eq!(sla.violations, 1);
        assert_eq!(sla.consecutive_failures, 0);
        assert_eq!(sla.last_round, 7);
    }

    #[test]
    fn test_duplicate_record_is_noop() {
        let store = store();
        assert!(store.record(&entry(1, CheckStatus::Down)).unwrap());
        assert!(!store.record(&entry(1, CheckStatus::Down)).unwrap());
        assert!(!store.record(&entry(1, CheckStatus::Up)).unwrap());

        let sla = store.sla(1, "C1").unwrap();
        assert_eq!(sla.consecutive_failures, 1);
        assert_eq!(
            store.result(1, "C1", 1).unwrap().unwrap().status,
            CheckStatus::Down
        );
    }

    #[test]
    fn test_uptime_percentage() {
        let store = store();
        assert_eq!(store.uptime(1, "C1").unwrap().percentage(), 0.0);

        store.record(&entry(1, CheckStatus::Up)).unwrap();
        store.record(&entry(2, CheckStatus::Up)).unwrap();
        store.record(&entry(3, CheckStatus::Up)).unwrap();
        store.record(&entry(4, CheckStatus::Error)).unwrap();

        let uptime = store.uptime(1, "C1").unwrap();
        assert_eq!(uptime, Uptime { up: 3, total: 4 });
        assert!((uptime.percentage() - 75.0).abs() < f64::EPSILON);
        assert_eq!(store.export_team(1).unwrap().len(), 4);
    }

    #[test]
    fn test_unrecorded_pair_has_zeroed_sla() {
        let store = store();
        let sla = store.sla(4, "dns").unwrap();
        assert_eq!(sla.violations, 0);
        assert_eq!(sla.consecutive_failures, 0);
    }
}
