//! Lifecycle of one ETL execution.
//!
//! Run status moves `queued → running → completed | failed`. Each of the five
//! phases moves `pending → running → completed | failed | skipped` on its own.
//! Phase order is not enforced: a phase may be re-entered after a later one
//! finished, and that is logged rather than rejected. Run status is stricter:
//! only a queued run starts, and only a running run completes or fails.

use crate::errors::{AppError, AppResult};
use crate::models::{PhaseBoard, PhaseState, RunCounters, RunStatus, SyncPhase, SyncRun, TriggerType};
use chrono::{DateTime, Utc};

pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

impl RunCounters {
    /// Adds every counter of `delta`; zero fields leave the running value untouched.
    pub fn absorb(&mut self, delta: &RunCounters) {
        self.rows_fetched = self.rows_fetched.saturating_add(delta.rows_fetched);
        self.rows_upserted = self.rows_upserted.saturating_add(delta.rows_upserted);
        self.posts_classified = self.posts_classified.saturating_add(delta.posts_classified);
        self.comments_classified = self.comments_classified.saturating_add(delta.comments_classified);
        self.buckets_aggregated = self.buckets_aggregated.saturating_add(delta.buckets_aggregated);
        self.channels_reconciled = self.channels_reconciled.saturating_add(delta.channels_reconciled);
        self.incidents_raised = self.incidents_raised.saturating_add(delta.incidents_raised);
        self.warnings = self.warnings.saturating_add(delta.warnings);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseUpdate {
    pub state: PhaseState,
    pub details: Option<serde_json::Value>,
    pub counters: RunCounters,
}

impl SyncRun {
    pub fn new(id: String, trigger: TriggerType, now: DateTime<Utc>) -> Self {
        Self {
            id,
            trigger,
            status: RunStatus::Queued,
            phases: PhaseBoard::default(),
            counters: RunCounters::default(),
            error_message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_status(RunStatus::Queued, "start")?;
        self.status = RunStatus::Running;
        self.phases = PhaseBoard::default();
        self.started_at = Some(now);
        self.finished_at = None;
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn update_phase(&mut self, phase: SyncPhase, update: PhaseUpdate, now: DateTime<Utc>) {
        if let Some(later) = self.later_finished_phase(phase) {
            tracing::warn!(
                run_id = %self.id,
                phase = phase.as_str(),
                later_phase = later.as_str(),
                "re-entering sync phase after a later phase finished"
            );
        }
        if self.status == RunStatus::Queued {
            self.status = RunStatus::Running;
            self.started_at.get_or_insert(now);
        }

        let slot = self.phases.get_mut(phase);
        slot.state = update.state;
        if update.state != PhaseState::Pending && slot.started_at.is_none() {
            slot.started_at = Some(now);
        }
        slot.finished_at = if update.state.is_terminal() { Some(now) } else { None };
        if update.details.is_some() {
            slot.details = update.details;
        }

        self.counters.absorb(&update.counters);
        self.updated_at = now;
    }

    /// Marks the run completed, closing any phase that never reached a terminal state.
    pub fn complete(&mut self, counters: &RunCounters, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_status(RunStatus::Running, "complete")?;
        for phase in SyncPhase::ALL {
            let slot = self.phases.get_mut(phase);
            if !slot.state.is_terminal() {
                slot.state = PhaseState::Completed;
                slot.started_at.get_or_insert(now);
                slot.finished_at = Some(now);
            }
        }
        self.counters.absorb(counters);
        self.status = RunStatus::Completed;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Marks the current phase and the run failed. Accumulated counters are kept.
    pub fn fail(&mut self, phase: Option<SyncPhase>, message: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.ensure_status(RunStatus::Running, "fail")?;
        let failed_phase = phase.or_else(|| self.current_phase());
        if let Some(failed_phase) = failed_phase {
            let slot = self.phases.get_mut(failed_phase);
            slot.state = PhaseState::Failed;
            slot.started_at.get_or_insert(now);
            slot.finished_at = Some(now);
        }
        self.error_message = Some(truncate_message(message));
        self.status = RunStatus::Failed;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// The running phase, else the first phase that has not finished.
    pub fn current_phase(&self) -> Option<SyncPhase> {
        SyncPhase::ALL
            .into_iter()
            .find(|phase| self.phases.get(*phase).state == PhaseState::Running)
            .or_else(|| {
                SyncPhase::ALL
                    .into_iter()
                    .find(|phase| !self.phases.get(*phase).state.is_terminal())
            })
    }

    fn ensure_status(&self, expected: RunStatus, action: &str) -> AppResult<()> {
        if self.status == expected {
            return Ok(());
        }
        Err(AppError::Conflict(format!(
            "cannot {} sync run {} in status {}",
            action,
            self.id,
            self.status.as_str()
        )))
    }

    fn later_finished_phase(&self, phase: SyncPhase) -> Option<SyncPhase> {
        SyncPhase::ALL
            .into_iter()
            .filter(|candidate| candidate.ordinal() > phase.ordinal())
            .find(|candidate| self.phases.get(*candidate).state.is_terminal())
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn started_run() -> (SyncRun, DateTime<Utc>) {
        let now = Utc::now();
        let mut run = SyncRun::new("run-1".to_string(), TriggerType::Manual, now);
        run.start(now).expect("start queued run");
        (run, now)
    }

    #[test]
    fn start_initializes_all_phases_pending() {
        let (run, _) = started_run();
        assert_eq!(run.status, RunStatus::Running);
        for phase in SyncPhase::ALL {
            assert_eq!(run.phases.get(phase).state, PhaseState::Pending);
        }
    }

    #[test]
    fn phase_start_time_is_set_once_and_finish_on_terminal() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Ingest,
            PhaseUpdate {
                state: PhaseState::Running,
                ..PhaseUpdate::default()
            },
            now,
        );
        let later = now + Duration::minutes(5);
        run.update_phase(
            SyncPhase::Ingest,
            PhaseUpdate {
                state: PhaseState::Completed,
                details: Some(json!({"files": 3})),
                ..PhaseUpdate::default()
            },
            later,
        );
        let ingest = run.phases.get(SyncPhase::Ingest);
        assert_eq!(ingest.started_at, Some(now));
        assert_eq!(ingest.finished_at, Some(later));
        assert_eq!(ingest.details, Some(json!({"files": 3})));
    }

    #[test]
    fn counters_merge_additively() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Ingest,
            PhaseUpdate {
                state: PhaseState::Running,
                counters: RunCounters {
                    rows_fetched: 10,
                    ..RunCounters::default()
                },
                ..PhaseUpdate::default()
            },
            now,
        );
        run.update_phase(
            SyncPhase::Classify,
            PhaseUpdate {
                state: PhaseState::Running,
                counters: RunCounters {
                    rows_fetched: 5,
                    posts_classified: 7,
                    ..RunCounters::default()
                },
                ..PhaseUpdate::default()
            },
            now,
        );
        assert_eq!(run.counters.rows_fetched, 15);
        assert_eq!(run.counters.posts_classified, 7);
        assert_eq!(run.counters.rows_upserted, 0);
    }

    #[test]
    fn complete_force_completes_open_phases() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Reconcile,
            PhaseUpdate {
                state: PhaseState::Skipped,
                ..PhaseUpdate::default()
            },
            now,
        );
        run.complete(&RunCounters::default(), now).expect("complete");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phases.get(SyncPhase::Reconcile).state, PhaseState::Skipped);
        for phase in [SyncPhase::Ingest, SyncPhase::Classify, SyncPhase::Aggregate, SyncPhase::Alerts] {
            assert_eq!(run.phases.get(phase).state, PhaseState::Completed);
            assert!(run.phases.get(phase).finished_at.is_some());
        }
    }

    #[test]
    fn fail_marks_running_phase_and_truncates_message() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Aggregate,
            PhaseUpdate {
                state: PhaseState::Running,
                counters: RunCounters {
                    buckets_aggregated: 4,
                    ..RunCounters::default()
                },
                ..PhaseUpdate::default()
            },
            now,
        );
        let long = "x".repeat(MAX_ERROR_MESSAGE_CHARS + 50);
        run.fail(None, &long, now).expect("fail");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phases.get(SyncPhase::Aggregate).state, PhaseState::Failed);
        assert_eq!(run.counters.buckets_aggregated, 4);
        assert_eq!(run.error_message.as_ref().map(|message| message.chars().count()), Some(MAX_ERROR_MESSAGE_CHARS));
    }

    #[test]
    fn earlier_phase_can_be_reentered() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Alerts,
            PhaseUpdate {
                state: PhaseState::Completed,
                ..PhaseUpdate::default()
            },
            now,
        );
        run.update_phase(
            SyncPhase::Ingest,
            PhaseUpdate {
                state: PhaseState::Running,
                ..PhaseUpdate::default()
            },
            now,
        );
        assert_eq!(run.phases.get(SyncPhase::Ingest).state, PhaseState::Running);
        assert_eq!(run.current_phase(), Some(SyncPhase::Ingest));
    }

    #[test]
    fn finished_runs_reject_further_transitions() {
        let (mut run, now) = started_run();
        run.update_phase(
            SyncPhase::Ingest,
            PhaseUpdate {
                state: PhaseState::Running,
                ..PhaseUpdate::default()
            },
            now,
        );
        run.fail(None, "source export missing", now).expect("fail");
        let failed = run.clone();

        let later = now + Duration::minutes(1);
        assert_eq!(run.complete(&RunCounters::default(), later).unwrap_err().kind(), "conflict");
        assert_eq!(run.fail(None, "again", later).unwrap_err().kind(), "conflict");
        assert_eq!(run.start(later).unwrap_err().kind(), "conflict");
        assert_eq!(run, failed);
        assert_eq!(run.phases.get(SyncPhase::Ingest).state, PhaseState::Failed);
    }

    #[test]
    fn completed_run_cannot_restart() {
        let (mut run, now) = started_run();
        run.complete(&RunCounters::default(), now).expect("complete");
        let completed = run.clone();
        assert_eq!(run.start(now + Duration::hours(1)).unwrap_err().kind(), "conflict");
        assert_eq!(run, completed);
    }

    #[test]
    fn queued_run_cannot_finish_before_starting() {
        let now = Utc::now();
        let mut run = SyncRun::new("run-2".to_string(), TriggerType::Scheduled, now);
        assert_eq!(run.complete(&RunCounters::default(), now).unwrap_err().kind(), "conflict");
        assert_eq!(run.fail(Some(SyncPhase::Ingest), "boom", now).unwrap_err().kind(), "conflict");
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.finished_at.is_none());
        assert!(run.error_message.is_none());
    }
}
