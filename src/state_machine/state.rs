use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::job::{Job, StateTransition};
use crate::error::PrismError;
use crate::store::JobStore;

/// Lifecycle states of a generation job.
///
/// CREATED → SUBMITTED → RUNNING → SUCCEEDED, with FAILED reachable from every
/// non-terminal state. SUCCEEDED may re-enter RUNNING for late renders and
/// finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Created,
        JobState::Submitted,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
    ];

    /// States reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [JobState] {
        match self {
            JobState::Created => &[JobState::Submitted, JobState::Failed],
            JobState::Submitted => &[JobState::Running, JobState::Failed],
            JobState::Running => &[JobState::Succeeded, JobState::Failed],
            JobState::Succeeded => &[JobState::Running],
            JobState::Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// FAILED has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Whether a status poller can stop waiting on this state.
    pub fn is_settled(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "CREATED"),
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Validates and records lifecycle changes through a [`JobStore`].
pub struct StateMachine;

impl StateMachine {
    pub fn validate(from: JobState, to: JobState) -> Result<(), PrismError> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(PrismError::InvalidTransition { from, to })
        }
    }

    /// Move a stored job to `to`, appending `event` to its transition log.
    ///
    /// A missing job yields [`PrismError::JobNotFound`], which callers can tell
    /// apart from [`PrismError::InvalidTransition`].
    pub async fn transition(
        store: &dyn JobStore,
        job_id: &str,
        to: JobState,
        event: &str,
        at: DateTime<Utc>,
    ) -> Result<Job, PrismError> {
        let job = store
            .get(job_id)
            .await?
            .ok_or_else(|| PrismError::JobNotFound(job_id.to_string()))?;

        if let Err(err) = Self::validate(job.state, to) {
            warn!(job_id, from = %job.state, to = %to, event, "rejected state transition");
            return Err(err);
        }

        let updated = store
            .append_transition(job_id, StateTransition::new(to, at, event))
            .await?;
        debug!(job_id, from = %job.state, to = %to, event, "state transition");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::store::InMemoryJobStore;

    fn expected(from: JobState, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (from, to),
            (Created, Submitted)
                | (Created, Failed)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Running)
        )
    }

    #[test]
    fn transition_table_matches_every_pair() {
        for from in JobState::ALL {
            for to in JobState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    expected(from, to),
                    "{from} -> {to}"
                );
                assert_eq!(StateMachine::validate(from, to).is_ok(), expected(from, to));
            }
        }
    }

    #[test]
    fn failed_is_the_only_terminal_state() {
        for state in JobState::ALL {
            assert_eq!(state.is_terminal(), state == JobState::Failed);
        }
        assert!(JobState::Succeeded.is_settled());
        assert!(!JobState::Running.is_settled());
    }

    #[test]
    fn state_display_and_serde_agree() {
        for state in JobState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[tokio::test]
    async fn transition_appends_to_log() {
        let store = InMemoryJobStore::new(Arc::new(SystemClock));
        let job = store.create(Job::new("fast", Vec::new(), Utc::now())).await.unwrap();

        let job = StateMachine::transition(
            &store,
            &job.job_id,
            JobState::Submitted,
            "workflow_submitted",
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.state_transitions.len(), 2);
        assert_eq!(job.state_transitions[1].event, "workflow_submitted");
        assert!(job.submitted_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_leaves_job_untouched() {
        let store = InMemoryJobStore::new(Arc::new(SystemClock));
        let job = store.create(Job::new("fast", Vec::new(), Utc::now())).await.unwrap();

        let err = StateMachine::transition(
            &store,
            &job.job_id,
            JobState::Succeeded,
            "skipped_ahead",
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PrismError::InvalidTransition {
                from: JobState::Created,
                to: JobState::Succeeded
            }
        ));

        let stored = store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Created);
        assert_eq!(stored.state_transitions.len(), 1);
    }

    #[tokio::test]
    async fn missing_job_is_not_an_invalid_transition() {
        let store = InMemoryJobStore::new(Arc::new(SystemClock));
        let err = StateMachine::transition(
            &store,
            "nope",
            JobState::Submitted,
            "workflow_submitted",
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PrismError::JobNotFound(id) if id == "nope"));
    }
}
