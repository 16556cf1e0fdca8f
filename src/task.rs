//! Task lifecycle state machine.
//!
//! ```text
//! Pending ──▶ Starting ──▶ Processing ──▶ Succeeded
//!    │           │             │
//!    ├───────────┴─────────────┴──▶ Failed
//!    └───────────┴─────────────┴──▶ Cancelled
//! ```
//!
//! `Succeeded`, `Failed` and `Cancelled` accept no further transitions.
//! Entering `Processing` stamps `started_at`; entering `Succeeded` stamps
//! `finished_at`. `Failed` and `Cancelled` leave `finished_at` unset.

use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::models::{Task, TaskStatus};

impl TaskStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Starting, Processing)
                | (Starting, Failed)
                | (Starting, Cancelled)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl Task {
    /// Move to `next`, applying the timestamp rules.
    pub fn transition_to(
        &mut self,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidState {
                task_id: self.id.clone(),
                status: self.status,
                action: transition_action(next),
            });
        }
        match next {
            TaskStatus::Processing => self.started_at = Some(now),
            TaskStatus::Succeeded => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Enter `Processing` with an optional completion estimate.
    pub fn start_processing(
        &mut self,
        now: DateTime<Utc>,
        estimated_finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), PipelineError> {
        self.transition_to(TaskStatus::Processing, now)?;
        self.estimated_finished_at = estimated_finished_at;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), PipelineError> {
        self.transition_to(TaskStatus::Cancelled, now)
    }

    /// The moment after which the task may be purged.
    pub fn purge_at(&self) -> Option<DateTime<Utc>> {
        self.delete_at.or(self.expires_at)
    }
}

fn transition_action(next: TaskStatus) -> &'static str {
    match next {
        TaskStatus::Pending => "return to pending",
        TaskStatus::Starting => "start",
        TaskStatus::Processing => "begin processing",
        TaskStatus::Succeeded => "succeed",
        TaskStatus::Failed => "fail",
        TaskStatus::Cancelled => "cancel",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkingMethod;

    fn task(status: TaskStatus) -> Task {
        Task {
            id: "t1".to_string(),
            chunking_method: ChunkingMethod::Semantic,
            chunk_size: 1024,
            chunk_overlap: 0,
            status,
            created_at: Utc::now(),
            started_at: None,
            estimated_finished_at: None,
            finished_at: None,
            expires_at: None,
            delete_at: None,
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in [TaskStatus::Succeeded, TaskStatus::Failed] {
            for to in TaskStatus::ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{} -> {} must be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_cancel_reachable_only_from_non_terminal() {
        for from in TaskStatus::ALL {
            let expected = matches!(
                from,
                TaskStatus::Pending | TaskStatus::Starting | TaskStatus::Processing
            );
            assert_eq!(from.can_transition_to(TaskStatus::Cancelled), expected);
        }
    }

    #[test]
    fn test_happy_path_stamps() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Pending);
        t.transition_to(TaskStatus::Starting, now).unwrap();
        assert!(t.started_at.is_none());
        t.start_processing(now, Some(now)).unwrap();
        assert_eq!(t.started_at, Some(now));
        assert_eq!(t.estimated_finished_at, Some(now));
        t.transition_to(TaskStatus::Succeeded, now).unwrap();
        assert_eq!(t.finished_at, Some(now));
        assert_eq!(t.status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_failed_leaves_finished_at_unset() {
        let mut t = task(TaskStatus::Processing);
        t.transition_to(TaskStatus::Failed, Utc::now()).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.finished_at.is_none());
    }

    #[test]
    fn test_rejected_transition_does_not_mutate() {
        let mut t = task(TaskStatus::Succeeded);
        let before = t.clone();
        let err = t.cancel(Utc::now()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert_eq!(t, before);
    }

    #[test]
    fn test_skipping_starting_is_rejected() {
        let mut t = task(TaskStatus::Pending);
        assert!(t.transition_to(TaskStatus::Processing, Utc::now()).is_err());
    }

    #[test]
    fn test_purge_at_prefers_delete_at() {
        let now = Utc::now();
        let mut t = task(TaskStatus::Succeeded);
        assert_eq!(t.purge_at(), None);
        t.expires_at = Some(now);
        assert_eq!(t.purge_at(), Some(now));
        let later = now + chrono::Duration::minutes(5);
        t.delete_at = Some(later);
        assert_eq!(t.purge_at(), Some(later));
    }
}
