//! Ties gating, session lifecycle and the reading timer into the reader's
//! walk through a condition.

mod gate;

pub use gate::{
    block_number, block_progress, gate_after, is_block_boundary, total_blocks, unlock_at,
    BlockProgress, ProgressStatus, StartGate,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    config::StudyConfig,
    db::Database,
    error::{Result, StudyError},
    local::{FileLocalStore, LocalStore},
    models::{CaseAnswer, Condition, ReaderProfile, ReadingResult, ReadingTiming, Session},
    session::SessionLifecycle,
    timer::{TimerController, TimerSnapshot},
};

/// The case currently on the reading desk.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReadingStep {
    pub session_id: String,
    pub condition: Condition,
    pub case_index: u32,
    pub case_id: String,
    pub total_cases: u32,
    pub block_number: u32,
    pub total_blocks: u32,
    /// `case_index / total_cases`.
    pub progress: f64,
    pub timer: TimerSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BlockBreak {
    /// The block just finished, 1-based.
    pub block_number: u32,
    pub total_blocks: u32,
    pub completed_cases: u32,
    pub total_cases: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    Reading(ReadingStep),
    BlockBreak(BlockBreak),
    Finished(Session),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConditionPanel {
    pub condition: Condition,
    pub status: ProgressStatus,
    pub session_id: Option<String>,
    pub completed_cases: u32,
    pub total_cases: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub gate: StartGate,
    pub blocks: Vec<BlockProgress>,
}

struct Desk {
    session: Session,
    on_break: bool,
}

pub struct StudyFlow {
    config: Arc<StudyConfig>,
    db: Database,
    clock: Arc<dyn Clock>,
    sessions: SessionLifecycle,
    timer: TimerController,
    desk: Mutex<Option<Desk>>,
}

fn timer_key(session_id: &str, case_index: u32) -> String {
    format!("{session_id}_{case_index}")
}

impl StudyFlow {
    pub fn new(
        config: StudyConfig,
        db: Database,
        local: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let timer = TimerController::new(local, clock.clone(), config.timer_settings());
        Ok(Self {
            sessions: SessionLifecycle::new(db.clone(), clock.clone()),
            config: Arc::new(config),
            db,
            clock,
            timer,
            desk: Mutex::new(None),
        })
    }

    /// Opens the store and local state named by `config` on the system clock.
    pub fn open(config: StudyConfig) -> Result<Self> {
        let db = Database::new(config.database_path.clone())?
            .with_transaction_retries(config.transaction_retries);
        let local = FileLocalStore::new(config.local_state_path.clone())?;
        Self::new(config, db, Arc::new(local), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn sessions(&self) -> &SessionLifecycle {
        &self.sessions
    }

    pub fn timer(&self) -> &TimerController {
        &self.timer
    }

    fn previous_condition(&self, condition: Condition) -> Result<Option<Condition>> {
        let position = self
            .config
            .condition_order
            .iter()
            .position(|c| *c == condition)
            .ok_or_else(|| {
                StudyError::Config(format!("condition {condition} is not part of this study"))
            })?;
        Ok(position
            .checked_sub(1)
            .and_then(|prev| self.config.condition_order.get(prev).copied()))
    }

    /// Evaluated against the clock on every call.
    pub async fn gate(&self, reader_id: &str, condition: Condition) -> Result<StartGate> {
        let previous = match self.previous_condition(condition)? {
            Some(prev) => Some((prev, self.sessions.current(reader_id, prev).await?)),
            None => None,
        };
        let previous = previous.as_ref().map(|(c, s)| (*c, s.as_ref()));
        Ok(gate_after(previous, self.config.washout(), self.clock.now()))
    }

    pub async fn task_panel(&self, reader_id: &str) -> Result<Vec<ConditionPanel>> {
        let now = self.clock.now();
        let mut panel = Vec::with_capacity(self.config.condition_order.len());
        let mut previous: Option<(Condition, Option<Session>)> = None;

        for &condition in &self.config.condition_order {
            let session = self.sessions.current(reader_id, condition).await?;
            let gate = gate_after(
                previous.as_ref().map(|(c, s)| (*c, s.as_ref())),
                self.config.washout(),
                now,
            );
            let (status, completed_cases, total_cases) = match &session {
                Some(s) if s.is_completed() => {
                    (ProgressStatus::Completed, s.completed_cases, s.total_cases)
                }
                Some(s) => (ProgressStatus::InProgress, s.completed_cases, s.total_cases),
                None => (ProgressStatus::NotStarted, 0, 0),
            };
            panel.push(ConditionPanel {
                condition,
                status,
                session_id: session.as_ref().map(|s| s.session_id.clone()),
                completed_cases,
                total_cases,
                completed_at: session.as_ref().and_then(|s| s.completed_at),
                gate,
                blocks: block_progress(completed_cases, total_cases, self.config.block_size),
            });
            previous = Some((condition, session));
        }
        Ok(panel)
    }

    /// Resumes the reader's in-progress session for `condition`, or creates
    /// one when the gate is open, and starts the timer on the next unread case.
    /// A session whose cases were all recorded but never finalized is
    /// finalized here and returned as `Finished`.
    pub async fn start_or_resume(
        &self,
        reader: &ReaderProfile,
        condition: Condition,
    ) -> Result<FlowStep> {
        let session = match self.sessions.current(&reader.reader_id, condition).await? {
            Some(session) if session.is_completed() => {
                return Err(StudyError::SessionCompleted(session.session_id));
            }
            Some(session) if session.all_cases_read() => {
                warn!(
                    "Session {} has every case read but was never finalized",
                    session.session_id
                );
                let finished = self.sessions.finalize(&session.session_id).await?;
                return Ok(FlowStep::Finished(finished));
            }
            Some(session) => {
                info!(
                    "Resuming session {} for {} at case {}/{}",
                    session.session_id,
                    reader.reader_id,
                    session.next_case_index() + 1,
                    session.total_cases
                );
                session
            }
            None => {
                let gate = self.gate(&reader.reader_id, condition).await?;
                if let Some(reason) = gate.lock_reason() {
                    info!("Refusing {condition} for {}: {reason}", reader.reader_id);
                    return Err(StudyError::ConditionLocked { condition, reason });
                }
                let pool = self.db.case_pool().await?;
                self.sessions.create(reader, condition, &pool).await?
            }
        };

        let mut desk = self.desk.lock().await;
        self.timer.persist_on_unload().await;
        let step = self.begin_case(&session).await?;
        *desk = Some(Desk {
            session,
            on_break: false,
        });
        Ok(FlowStep::Reading(step))
    }

    async fn begin_case(&self, session: &Session) -> Result<ReadingStep> {
        let case_index = session.next_case_index();
        let case_id = session
            .current_case()
            .ok_or(StudyError::NoActiveReading)?
            .to_string();
        let timer = self
            .timer
            .start(Some(&timer_key(&session.session_id, case_index)))
            .await?;
        Ok(self.step_for(session, case_index, case_id, timer))
    }

    fn step_for(
        &self,
        session: &Session,
        case_index: u32,
        case_id: String,
        timer: TimerSnapshot,
    ) -> ReadingStep {
        let block_size = self.config.block_size;
        ReadingStep {
            session_id: session.session_id.clone(),
            condition: session.condition,
            case_index,
            case_id,
            total_cases: session.total_cases,
            block_number: block_number(case_index, block_size),
            total_blocks: total_blocks(session.total_cases, block_size),
            progress: session.progress_fraction(),
            timer,
        }
    }

    pub async fn current_step(&self) -> Option<ReadingStep> {
        let desk = self.desk.lock().await;
        let desk = desk.as_ref().filter(|d| !d.on_break)?;
        let case_id = desk.session.current_case()?.to_string();
        let timer = self.timer.get_snapshot().await;
        Some(self.step_for(&desk.session, desk.session.next_case_index(), case_id, timer))
    }

    /// Records `answer` for the case on the desk. On any failure the timer
    /// stays stopped and the caller keeps the answer; submitting again
    /// measures time up to the retry.
    pub async fn submit_case(&self, answer: &CaseAnswer) -> Result<FlowStep> {
        let mut guard = self.desk.lock().await;
        let desk = guard.as_mut().ok_or(StudyError::NoActiveReading)?;
        if desk.on_break {
            return Err(StudyError::NoActiveReading);
        }

        if !desk.session.all_cases_read() {
            let case_id = desk
                .session
                .current_case()
                .ok_or(StudyError::NoActiveReading)?
                .to_string();
            answer.validate(desk.session.condition)?;

            let reading = self.timer.stop().await?;
            let timing = ReadingTiming {
                reading_time_ms: reading.net_ms,
                pause_count: reading.pause_count,
                pause_total_ms: reading.pause_total_ms,
            };
            let result =
                ReadingResult::build(&desk.session, &case_id, answer.clone(), timing, self.clock.now())?;

            let recorded = match self.sessions.record_result(result).await {
                Ok(recorded) => recorded,
                Err(err) => {
                    warn!(
                        "Submission of {case_id} in session {} failed ({}): {err}",
                        desk.session.session_id,
                        if err.is_retryable() { "retryable" } else { "permanent" }
                    );
                    self.timer.retain_stopped().await;
                    return Err(err);
                }
            };
            self.timer.reset().await;
            desk.session = recorded.session;
        }

        let session = desk.session.clone();
        if session.all_cases_read() {
            let finished = self.sessions.finalize(&session.session_id).await?;
            *guard = None;
            return Ok(FlowStep::Finished(finished));
        }

        let next_index = session.next_case_index();
        let block_size = self.config.block_size;
        if is_block_boundary(next_index, session.total_cases, block_size) {
            desk.on_break = true;
            let pause = BlockBreak {
                block_number: next_index / block_size,
                total_blocks: total_blocks(session.total_cases, block_size),
                completed_cases: session.completed_cases,
                total_cases: session.total_cases,
            };
            info!(
                "Session {} reached the end of block {}/{}",
                session.session_id, pause.block_number, pause.total_blocks
            );
            return Ok(FlowStep::BlockBreak(pause));
        }

        Ok(FlowStep::Reading(self.begin_case(&session).await?))
    }

    /// Leaves a block break and starts the next case.
    pub async fn continue_after_break(&self) -> Result<ReadingStep> {
        let mut guard = self.desk.lock().await;
        let desk = guard.as_mut().ok_or(StudyError::NoActiveReading)?;
        if !desk.on_break {
            let case_id = desk
                .session
                .current_case()
                .ok_or(StudyError::NoActiveReading)?
                .to_string();
            let timer = self.timer.get_snapshot().await;
            return Ok(self.step_for(&desk.session, desk.session.next_case_index(), case_id, timer));
        }
        let step = self.begin_case(&desk.session).await?;
        desk.on_break = false;
        Ok(step)
    }

    async fn ensure_reading(&self) -> Result<()> {
        match self.desk.lock().await.as_ref() {
            Some(desk) if !desk.on_break => Ok(()),
            _ => Err(StudyError::NoActiveReading),
        }
    }

    pub async fn pause_reading(&self) -> Result<TimerSnapshot> {
        self.ensure_reading().await?;
        self.timer.pause().await
    }

    pub async fn resume_reading(&self) -> Result<TimerSnapshot> {
        self.ensure_reading().await?;
        self.timer.resume().await
    }

    pub async fn persist_on_unload(&self) {
        self.timer.persist_on_unload().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        db::DocRef,
        error::LockReason,
        local::MemoryLocalStore,
        models::{AiReference, Case, DiagnosisClass, ExperienceLevel, SessionStatus},
        timer::TimerStatus,
    };
    use chrono::{Duration, TimeZone};

    fn reader() -> ReaderProfile {
        ReaderProfile {
            email: "osk1@example.org".into(),
            reader_id: "OSK_001".into(),
            reader_number: 1,
            facility_id: "osaka".into(),
            facility_name: "Osaka".into(),
            reader_level: ExperienceLevel::Resident,
            display_name: None,
            disabled: false,
        }
    }

    fn case(id: &str) -> Case {
        Case {
            case_id: id.into(),
            basename: format!("{id}.jpg"),
            ground_truth: "infection".into(),
            ai_prediction: "infection".into(),
            ai_confidence: 0.8,
            ai_correct: true,
            has_prediction: true,
        }
    }

    struct Fixture {
        db: Database,
        local: Arc<MemoryLocalStore>,
        clock: ManualClock,
    }

    impl Fixture {
        async fn new(case_ids: &[&str]) -> Self {
            let db = Database::open_in_memory().unwrap();
            db.seed_cases(case_ids.iter().map(|id| case(id)).collect())
                .await
                .unwrap();
            Self {
                db,
                local: Arc::new(MemoryLocalStore::new()),
                clock: ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()),
            }
        }

        fn flow(&self, config: StudyConfig) -> StudyFlow {
            StudyFlow::new(
                config,
                self.db.clone(),
                self.local.clone(),
                Arc::new(self.clock.clone()),
            )
            .unwrap()
        }
    }

    fn answer() -> CaseAnswer {
        CaseAnswer::new(DiagnosisClass::Infection, 4)
    }

    fn reading(step: FlowStep) -> ReadingStep {
        match step {
            FlowStep::Reading(step) => step,
            other => panic!("expected a reading step, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_resumes_and_finishes_a_condition() {
        let fx = Fixture::new(&["C1", "C2", "C3"]).await;
        let flow = fx.flow(StudyConfig::default());

        let first = reading(flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap());
        assert_eq!(first.case_index, 0);
        let order = flow.sessions().get(&first.session_id).await.unwrap().case_order;

        fx.clock.advance_ms(4_000);
        let second = match flow.submit_case(&answer()).await.unwrap() {
            FlowStep::Reading(step) => step,
            other => panic!("unexpected {other:?}"),
        };
        fx.clock.advance_ms(6_000);
        let third = match flow.submit_case(&answer()).await.unwrap() {
            FlowStep::Reading(step) => step,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(second.case_id, order[1]);
        assert_eq!(third.case_index, 2);

        // Reload mid-case: a fresh flow over the same store and device state.
        fx.clock.advance_ms(9_000);
        flow.persist_on_unload().await;
        drop(flow);
        let flow = fx.flow(StudyConfig::default());
        fx.clock.advance_ms(60_000);

        let resumed = reading(flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap());
        assert_eq!(resumed.case_index, 2);
        assert_eq!(resumed.case_id, order[2]);
        assert_eq!(resumed.timer.elapsed_ms, 9_000);
        let session = flow.sessions().get(&resumed.session_id).await.unwrap();
        assert_eq!(session.completed_cases, 2);

        fx.clock.advance_ms(1_000);
        let finished = match flow.submit_case(&answer()).await.unwrap() {
            FlowStep::Finished(session) => session,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(finished.status, SessionStatus::Completed);
        assert_eq!(finished.completed_cases, 3);
        assert_eq!(finished.completed_at, Some(fx.clock.now()));

        let results = fx.db.session_results(&finished.session_id).await.unwrap();
        let times: Vec<u64> = results.iter().map(|r| r.reading_time_ms).collect();
        assert_eq!(times, vec![4_000, 6_000, 10_000]);
        assert!(fx.local.keys().is_empty());

        assert!(matches!(
            flow.start_or_resume(&reader(), Condition::Unaided).await,
            Err(StudyError::SessionCompleted(_))
        ));
    }

    #[tokio::test]
    async fn later_conditions_wait_for_order_and_washout() {
        let fx = Fixture::new(&["C1"]).await;
        let flow = fx.flow(StudyConfig::default());

        assert!(matches!(
            flow.start_or_resume(&reader(), Condition::AiOnly).await,
            Err(StudyError::ConditionLocked {
                condition: Condition::AiOnly,
                reason: LockReason::AwaitingPrevious(Condition::Unaided),
            })
        ));

        flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap();
        let done = match flow.submit_case(&answer()).await.unwrap() {
            FlowStep::Finished(session) => session,
            other => panic!("unexpected {other:?}"),
        };
        let completed_at = done.completed_at.unwrap();

        fx.clock.set(completed_at + Duration::days(14) - Duration::seconds(1));
        assert!(matches!(
            flow.gate("OSK_001", Condition::AiOnly).await.unwrap(),
            StartGate::Washout { .. }
        ));
        fx.clock.set(completed_at + Duration::days(14) + Duration::seconds(1));
        assert!(flow.gate("OSK_001", Condition::AiOnly).await.unwrap().is_open());
        assert_eq!(
            flow.gate("OSK_001", Condition::AiGradcam).await.unwrap(),
            StartGate::AwaitingPrevious { previous: Condition::AiOnly }
        );

        let step = reading(flow.start_or_resume(&reader(), Condition::AiOnly).await.unwrap());
        assert_eq!(step.condition, Condition::AiOnly);
        assert!(matches!(
            flow.submit_case(&answer()).await,
            Err(StudyError::InvalidAnswer(_))
        ));
        assert_eq!(flow.timer().status().await, TimerStatus::Running);
        let with_reference = answer().with_ai_reference(AiReference::Followed);
        assert!(matches!(
            flow.submit_case(&with_reference).await.unwrap(),
            FlowStep::Finished(_)
        ));
    }

    #[tokio::test]
    async fn block_breaks_interrupt_between_blocks() {
        let fx = Fixture::new(&["C1", "C2", "C3", "C4", "C5"]).await;
        let config = StudyConfig {
            block_size: 2,
            ..StudyConfig::default()
        };
        let flow = fx.flow(config);
        flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap();
        flow.submit_case(&answer()).await.unwrap();

        let pause = flow.submit_case(&answer()).await.unwrap();
        assert_eq!(
            pause,
            FlowStep::BlockBreak(BlockBreak {
                block_number: 1,
                total_blocks: 3,
                completed_cases: 2,
                total_cases: 5,
            })
        );
        assert!(matches!(
            flow.submit_case(&answer()).await,
            Err(StudyError::NoActiveReading)
        ));
        assert!(flow.pause_reading().await.is_err());
        assert_eq!(flow.current_step().await, None);

        let next = flow.continue_after_break().await.unwrap();
        assert_eq!(next.case_index, 2);
        assert_eq!(next.block_number, 2);
        assert!((next.progress - 0.4).abs() < f64::EPSILON);

        let panel = flow.task_panel("OSK_001").await.unwrap();
        assert_eq!(panel[0].status, ProgressStatus::InProgress);
        assert_eq!(panel[0].blocks[0].status, ProgressStatus::Completed);
        assert_eq!(panel[0].blocks[1].status, ProgressStatus::NotStarted);
        assert_eq!(
            panel[1].gate,
            StartGate::AwaitingPrevious { previous: Condition::Unaided }
        );
    }

    #[tokio::test]
    async fn failed_submission_keeps_timer_for_retry() {
        let fx = Fixture::new(&["C1", "C2"]).await;
        let flow = fx.flow(StudyConfig::default());
        let step = reading(flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap());
        let session = flow.sessions().get(&step.session_id).await.unwrap();

        fx.clock.advance_ms(2_000);
        flow.pause_reading().await.unwrap();
        fx.clock.advance_ms(1_000);
        flow.resume_reading().await.unwrap();
        fx.clock.advance_ms(1_000);

        fx.db
            .delete_many(vec![DocRef::session(&session.session_id)], Vec::new())
            .await
            .unwrap();
        assert!(matches!(
            flow.submit_case(&answer()).await,
            Err(StudyError::SessionNotFound(_))
        ));
        assert_eq!(flow.timer().status().await, TimerStatus::Stopped);
        let first_key = format!("reading_timer_{}_0", session.session_id);
        assert_eq!(fx.local.keys(), vec![first_key.clone()]);

        fx.clock.advance_ms(500);
        fx.db.insert_session(&session).await.unwrap();
        assert!(matches!(
            flow.submit_case(&answer()).await.unwrap(),
            FlowStep::Reading(_)
        ));
        let result = fx
            .db
            .get_reading_result(&session.session_id, &step.case_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.reading_time_ms, 3_500);
        assert_eq!(result.pause_count, 1);
        assert_eq!(result.pause_total_ms, 1_000);
        assert_eq!(
            fx.local.keys(),
            vec![format!("reading_timer_{}_1", session.session_id)]
        );
    }

    #[tokio::test]
    async fn unfinalized_session_is_finished_on_resume() {
        let fx = Fixture::new(&["C1", "C2"]).await;
        let flow = fx.flow(StudyConfig::default());
        let pool = fx.db.case_pool().await.unwrap();
        let session = flow
            .sessions()
            .create(&reader(), Condition::Unaided, &pool)
            .await
            .unwrap();
        for case_id in &session.case_order {
            let result = ReadingResult::build(
                &session,
                case_id,
                answer(),
                ReadingTiming::default(),
                fx.clock.now(),
            )
            .unwrap();
            flow.sessions().record_result(result).await.unwrap();
        }

        let finished = match flow.start_or_resume(&reader(), Condition::Unaided).await.unwrap() {
            FlowStep::Finished(session) => session,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(finished.session_id, session.session_id);
        assert_eq!(finished.status, SessionStatus::Completed);
        assert_eq!(finished.completed_at, Some(fx.clock.now()));
        assert!(matches!(
            flow.start_or_resume(&reader(), Condition::Unaided).await,
            Err(StudyError::SessionCompleted(_))
        ));
    }

    #[tokio::test]
    async fn empty_pool_is_a_configuration_error() {
        let fx = Fixture::new(&[]).await;
        let flow = fx.flow(StudyConfig::default());
        assert!(matches!(
            flow.start_or_resume(&reader(), Condition::Unaided).await,
            Err(StudyError::EmptyCasePool)
        ));
        let panel = flow.task_panel("OSK_001").await.unwrap();
        assert!(panel.iter().all(|c| c.status == ProgressStatus::NotStarted));
        assert!(panel[0].gate.is_open());
    }
}
