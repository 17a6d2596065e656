//! Inject submission and grading workflow
//!
//! States per (inject, team):
//! 1. `published` - inject visible, no submission yet
//! 2. `submitted` - awaiting a grade
//! 3. `graded` (terminal, score attached) or `invalid` (rejected, team may resubmit)
//!
//! Transitions are atomic check-and-set operations on the stored state, so two
//! concurrent grade/invalidate calls on one submission cannot both succeed,
//! and a team can never hold two pending submissions for the same inject.
//! A submit while one is pending is rejected rather than replacing it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, ScoreError};
use crate::storage::ScoreStorage;
use crate::types::{
    GradeDecision, Inject, InjectStatus, InjectSubmission, NewInject, NewSubmission,
    SubmissionState, TeamId,
};

/// Title of the inject seeded for password change submissions
pub const PASSWORD_INJECT_TITLE: &str = "Password Changes";

/// Upper bound on a grade
pub const MAX_SCORE: u32 = 100;

pub struct InjectWorkflow {
    storage: Arc<dyn ScoreStorage>,
}

impl InjectWorkflow {
    pub fn new(storage: Arc<dyn ScoreStorage>) -> Self {
        Self { storage }
    }

    // ========================================================================
    // Injects
    // ========================================================================

    /// Publish an inject. Visible to all teams once stored.
    pub fn publish(&self, inject: NewInject) -> Result<Inject> {
        if inject.title.trim().is_empty() {
            return Err(ScoreError::InvalidRequest(
                "inject title must not be empty".to_string(),
            ));
        }
        let inject = self.storage.create_inject(&inject)?;
        info!("Published inject {} ({})", inject.id, inject.title);
        Ok(inject)
    }

    /// Seed the initial injects, but only into an empty inject table.
    ///
    /// Returns the number of injects published.
    pub fn seed_defaults(&self, password_inject: bool, configured: Vec<NewInject>) -> Result<usize> {
        if !self.storage.list_injects()?.is_empty() {
            debug!("Injects already present, skipping default inject seeding");
            return Ok(0);
        }

        // The password inject sorts first: never later than any configured inject
        let now = Utc::now();
        let first = configured.iter().map(|i| i.time).min().map_or(now, |t| t.min(now));

        let mut seeded = Vec::new();
        if password_inject {
            seeded.push(NewInject {
                time: first,
                title: PASSWORD_INJECT_TITLE.to_string(),
                body: "Submit your password changes here!".to_string(),
                deadline: None,
            });
        }
        seeded.extend(configured);

        let count = seeded.len();
        for inject in seeded {
            self.publish(inject)?;
        }
        Ok(count)
    }

    pub fn inject(&self, id: i64) -> Result<Inject> {
        self.storage
            .get_inject(id)?
            .ok_or_else(|| ScoreError::NotFound(format!("inject {}", id)))
    }

    pub fn injects(&self) -> Result<Vec<Inject>> {
        Ok(self.storage.list_injects()?)
    }

    // ========================================================================
    // Submissions
    // ========================================================================

    /// Submit an artifact for an inject at the current time
    pub fn submit(&self, inject_id: i64, team_id: TeamId, artifact: &str) -> Result<InjectSubmission> {
        self.submit_at(inject_id, team_id, artifact, Utc::now())
    }

    /// Submit an artifact, enforcing the deadline against `now`
    pub fn submit_at(
        &self,
        inject_id: i64,
        team_id: TeamId,
        artifact: &str,
        now: DateTime<Utc>,
    ) -> Result<InjectSubmission> {
        let inject = self.inject(inject_id)?;
        if !inject.is_open_at(now) {
            if let Some(deadline) = inject.deadline {
                warn!(
                    "Team {} submitted to inject {} after its deadline",
                    team_id, inject_id
                );
                return Err(ScoreError::DeadlinePassed {
                    inject_id,
                    deadline,
                });
            }
        }

        let submission = NewSubmission {
            inject_id,
            team_id,
            artifact: artifact.to_string(),
            submitted_at: now,
        };
        let created = self
            .storage
            .insert_submission_unless_pending(&submission)?
            .ok_or(ScoreError::PendingSubmission { inject_id, team_id })?;

        info!(
            "Team {} submitted inject {} (attempt {}, submission {})",
            team_id, inject_id, created.attempt, created.id
        );
        Ok(created)
    }

    /// Reject a pending submission without a score. The team may resubmit.
    pub fn invalidate(
        &self,
        submission_id: i64,
        grader: &str,
        feedback: Option<String>,
    ) -> Result<InjectSubmission> {
        let decision = GradeDecision {
            grader: grader.to_string(),
            score: None,
            feedback,
            decided_at: Utc::now(),
        };
        let updated = self.transition(submission_id, SubmissionState::Invalid, &decision)?;
        info!(
            "Submission {} for inject {} marked invalid by {}",
            submission_id, updated.inject_id, grader
        );
        Ok(updated)
    }

    /// Grade a pending submission. The score is final.
    pub fn grade(
        &self,
        submission_id: i64,
        grader: &str,
        score: u32,
        feedback: Option<String>,
    ) -> Result<InjectSubmission> {
        if score > MAX_SCORE {
            return Err(ScoreError::InvalidRequest(format!(
                "score {} exceeds maximum {}",
                score, MAX_SCORE
            )));
        }

        let decision = GradeDecision {
            grader: grader.to_string(),
            score: Some(score),
            feedback,
            decided_at: Utc::now(),
        };
        let updated = self.transition(submission_id, SubmissionState::Graded, &decision)?;
        info!(
            "Submission {} for inject {} graded {} by {}",
            submission_id, updated.inject_id, score, grader
        );
        Ok(updated)
    }

    fn transition(
        &self,
        submission_id: i64,
        to: SubmissionState,
        decision: &GradeDecision,
    ) -> Result<InjectSubmission> {
        let moved = self.storage.transition_submission(
            submission_id,
            SubmissionState::Submitted,
            to,
            decision,
        )?;
        let current = self.submission(submission_id)?;
        if !moved {
            return Err(ScoreError::StateConflict {
                submission_id,
                expected: SubmissionState::Submitted,
                actual: current.state,
            });
        }
        Ok(current)
    }

    pub fn submission(&self, submission_id: i64) -> Result<InjectSubmission> {
        self.storage
            .get_submission(submission_id)?
            .ok_or_else(|| ScoreError::NotFound(format!("submission {}", submission_id)))
    }

    pub fn submissions(&self, inject_id: i64) -> Result<Vec<InjectSubmission>> {
        Ok(self.storage.submissions_for_inject(inject_id)?)
    }

    /// Inject state as seen by a team, from its latest submission
    pub fn status_for(&self, inject_id: i64, team_id: TeamId) -> Result<InjectStatus> {
        self.inject(inject_id)?;
        Ok(self
            .storage
            .latest_submission(inject_id, team_id)?
            .map(|s| InjectStatus::from(s.state))
            .unwrap_or(InjectStatus::Published))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn workflow() -> InjectWorkflow {
        InjectWorkflow::new(Arc::new(LocalStorage::in_memory().unwrap()))
    }

    fn new_inject(deadline: Option<DateTime<Utc>>) -> NewInject {
        NewInject {
            time: Utc::now(),
            title: "Firewall audit".to_string(),
            body: "Document your firewall rules".to_string(),
            deadline,
        }
    }

    #[test]
    fn test_submit_then_grade_is_final() {
        let workflow = workflow();
        let inject = workflow.publish(new_inject(None)).unwrap();
        assert_eq!(workflow.status_for(inject.id, 3).unwrap(), InjectStatus::Published);

        let submission = workflow.submit(inject.id, 3, "audit.pdf").unwrap();
        assert_eq!(submission.state, SubmissionState::Submitted);
        assert_eq!(workflow.status_for(inject.id, 3).unwrap(), InjectStatus::Submitted);

        let graded = workflow
            .grade(submission.id, "white-team", 90, Some("thorough".to_string()))
            .unwrap();
        assert_eq!(graded.state, SubmissionState::Graded);
        assert_eq!(graded.score, Some(90));
        assert_eq!(graded.grader.as_deref(), Some("white-team"));

        let err = workflow.grade(submission.id, "other", 10, None).unwrap_err();
        assert!(matches!(
            err,
            ScoreError::StateConflict {
                actual: SubmissionState::Graded,
                ..
            }
        ));
        assert_eq!(workflow.submission(submission.id).unwrap().score, Some(90));

        assert!(workflow.invalidate(submission.id, "other", None).is_err());
        assert_eq!(workflow.status_for(inject.id, 3).unwrap(), InjectStatus::Graded);
    }

    #[test]
    fn test_invalidate_reopens_submission_window() {
        let workflow = workflow();
        let inject = workflow.publish(new_inject(None)).unwrap();

        let first = workflow.submit(inject.id, 1, "v1.txt").unwrap();
        let rejected = workflow
            .invalidate(first.id, "white-team", Some("empty file".to_string()))
            .unwrap();
        assert_eq!(rejected.state, SubmissionState::Invalid);
        assert_eq!(rejected.score, None);
        assert_eq!(workflow.status_for(inject.id, 1).unwrap(), InjectStatus::Invalid);

        let second = workflow.submit(inject.id, 1, "v2.txt").unwrap();
        assert_eq!(second.attempt, 2);
        assert!(matches!(
            workflow.grade(first.id, "white-team", 50, None),
            Err(ScoreError::StateConflict { .. })
        ));
        assert_eq!(workflow.submissions(inject.id).unwrap().len(), 2);
    }

    #[test]
    fn test_second_pending_submission_rejected() {
        let workflow = workflow();
        let inject = workflow.publish(new_inject(None)).unwrap();

        workflow.submit(inject.id, 1, "first.txt").unwrap();
        let err = workflow.submit(inject.id, 1, "second.txt").unwrap_err();
        assert!(err.is_conflict());

        // Other teams are unaffected
        workflow.submit(inject.id, 2, "first.txt").unwrap();
        assert_eq!(workflow.submissions(inject.id).unwrap().len(), 2);
    }

    #[test]
    fn test_deadline_checked_at_submit_time() {
        let workflow = workflow();
        let deadline = Utc::now() + chrono::Duration::hours(1);
        let inject = workflow.publish(new_inject(Some(deadline))).unwrap();

        workflow
            .submit_at(inject.id, 1, "on-time.txt", deadline - chrono::Duration::minutes(1))
            .unwrap();
        let err = workflow
            .submit_at(inject.id, 2, "late.txt", deadline + chrono::Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, ScoreError::DeadlinePassed { .. }));
    }

    #[test]
    fn test_unknown_inject_and_submission() {
        let workflow = workflow();
        assert!(matches!(
            workflow.submit(99, 1, "x"),
            Err(ScoreError::NotFound(_))
        ));
        assert!(matches!(
            workflow.grade(99, "white-team", 1, None),
            Err(ScoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_grade_bounds() {
        let workflow = workflow();
        let inject = workflow.publish(new_inject(None)).unwrap();
        let submission = workflow.submit(inject.id, 1, "x").unwrap();
        assert!(matches!(
            workflow.grade(submission.id, "white-team", MAX_SCORE + 1, None),
            Err(ScoreError::InvalidRequest(_))
        ));
        assert_eq!(
            workflow.submission(submission.id).unwrap().state,
            SubmissionState::Submitted
        );
    }

    #[test]
    fn test_seed_defaults_only_once() {
        let workflow = workflow();
        let seeded = workflow
            .seed_defaults(true, vec![new_inject(None)])
            .unwrap();
        assert_eq!(seeded, 2);
        assert_eq!(workflow.injects().unwrap()[0].title, PASSWORD_INJECT_TITLE);

        assert_eq!(workflow.seed_defaults(true, vec![new_inject(None)]).unwrap(), 0);
        assert_eq!(workflow.injects().unwrap().len(), 2);
    }

    #[test]
    fn test_password_inject_precedes_backdated_injects() {
        let workflow = workflow();
        let earlier = Utc::now() - chrono::Duration::hours(2);
        let backdated = NewInject {
            time: earlier,
            ..new_inject(None)
        };
        workflow
            .seed_defaults(true, vec![new_inject(None), backdated])
            .unwrap();

        let injects = workflow.injects().unwrap();
        assert_eq!(injects.len(), 3);
        assert_eq!(injects[0].title, PASSWORD_INJECT_TITLE);
        assert_eq!(injects[0].time, earlier);
        assert_eq!(injects[1].time, earlier);
    }

    #[test]
    fn test_concurrent_grades_single_winner() {
        let workflow = Arc::new(workflow());
        let inject = workflow.publish(new_inject(None)).unwrap();
        let submission = workflow.submit(inject.id, 1, "x").unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let workflow = workflow.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        workflow.grade(submission.id, "grader", 10 + i, None).is_ok()
                    } else {
                        workflow.invalidate(submission.id, "grader", None).is_ok()
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
