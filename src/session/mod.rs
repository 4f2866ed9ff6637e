//! Per-reader, per-condition progress records.
//!
//! `absent -> in_progress -> completed`. The reader's position is always
//! `completed_cases`; no separate pointer is ever stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    db::{Database, DocRef, DocTransaction},
    error::{Result, StudyError},
    models::{
        session::count_u32, Condition, ReaderProfile, ReadingResult, Session, SessionStatus,
    },
    shuffle::{derive_seed, seeded_shuffle},
};

/// Outcome of recording one case.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub session: Session,
    /// False when a result for this case already existed and was overwritten.
    pub newly_recorded: bool,
}

/// Where a resumed session picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub next_index: u32,
    pub case_id: Option<String>,
}

impl ResumePoint {
    pub fn of(session: &Session) -> Self {
        Self {
            next_index: session.next_case_index(),
            case_id: session.current_case().map(str::to_string),
        }
    }
}

/// Rejects any write that would move a session backwards or rewrite its
/// fixed fields.
fn check_transition(before: &Session, after: &Session) -> Result<()> {
    if before.status == SessionStatus::Completed && after.status != SessionStatus::Completed {
        return Err(StudyError::invariant(format!(
            "session {} moved from completed back to {}",
            before.session_id,
            after.status.as_str()
        )));
    }
    if after.completed_cases < before.completed_cases {
        return Err(StudyError::invariant(format!(
            "session {} completed_cases decreased from {} to {}",
            before.session_id, before.completed_cases, after.completed_cases
        )));
    }
    if before.case_order != after.case_order || before.total_cases != after.total_cases {
        return Err(StudyError::invariant(format!(
            "session {} case order was rewritten",
            before.session_id
        )));
    }
    after.check_invariants()
}

fn load_session(tx: &DocTransaction<'_>, session_id: &str) -> Result<Session> {
    tx.get::<Session>(&DocRef::session(session_id))?
        .ok_or_else(|| StudyError::SessionNotFound(session_id.to_string()))
}

fn sessions_for(tx: &DocTransaction<'_>, reader_id: &str, condition: Condition) -> Result<Vec<Session>> {
    let sessions: Vec<Session> = tx.find_by("sessions", "reader_id", reader_id)?;
    Ok(sessions
        .into_iter()
        .filter(|session| session.condition == condition)
        .collect())
}

#[derive(Clone)]
pub struct SessionLifecycle {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SessionLifecycle {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Materializes the case order and stores a new in-progress session.
    /// An in-progress session created concurrently for the same condition is
    /// returned instead of a second one.
    pub async fn create(
        &self,
        reader: &ReaderProfile,
        condition: Condition,
        case_pool: &[String],
    ) -> Result<Session> {
        if case_pool.is_empty() {
            error!(
                "Refusing to start {condition} for {}: case pool is empty",
                reader.reader_id
            );
            return Err(StudyError::EmptyCasePool);
        }

        let shuffle_seed = derive_seed(&reader.reader_id, condition);
        let case_order = seeded_shuffle(case_pool, shuffle_seed);
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            reader_id: reader.reader_id.clone(),
            facility: reader.facility_name.clone(),
            reader_level: reader.reader_level,
            condition,
            shuffle_seed,
            total_cases: count_u32(case_order.len(), "case pool size")?,
            case_order,
            started_at: self.clock.now(),
            completed_at: None,
            is_practice: false,
            completed_cases: 0,
            status: SessionStatus::InProgress,
        };
        session.check_invariants()?;

        let stored = self
            .db
            .transaction(move |tx| {
                let existing = sessions_for(tx, &session.reader_id, condition)?;
                if let Some(done) = existing.iter().find(|s| s.is_completed()) {
                    return Err(StudyError::SessionCompleted(done.session_id.clone()));
                }
                if let Some(active) = existing.into_iter().next() {
                    return Ok((active, false));
                }
                tx.put(&DocRef::session(&session.session_id), &session)?;
                Ok((session.clone(), true))
            })
            .await?;

        match stored {
            (session, true) => {
                info!(
                    "Created session {} for {} ({condition}, seed {}, {} cases)",
                    session.session_id, session.reader_id, session.shuffle_seed, session.total_cases
                );
                Ok(session)
            }
            (session, false) => {
                warn!(
                    "Session {} already in progress for {} ({condition}); reusing it",
                    session.session_id, session.reader_id
                );
                Ok(session)
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or_else(|| StudyError::SessionNotFound(session_id.to_string()))
    }

    /// The session that represents `condition` for this reader: a completed
    /// one wins over an in-progress one.
    pub async fn current(&self, reader_id: &str, condition: Condition) -> Result<Option<Session>> {
        let sessions = self.db.sessions_for_condition(reader_id, condition).await?;
        let completed = sessions.iter().find(|s| s.is_completed()).cloned();
        Ok(completed.or_else(|| sessions.into_iter().find(|s| !s.is_completed())))
    }

    pub async fn resume_point(&self, session_id: &str) -> Result<(Session, ResumePoint)> {
        let session = self.get(session_id).await?;
        let point = ResumePoint::of(&session);
        info!(
            "Resuming session {} at case index {} of {}",
            session.session_id, point.next_index, session.total_cases
        );
        Ok((session, point))
    }

    /// Stores `result` and counts it once. Re-recording a case overwrites the
    /// result without touching `completed_cases`.
    pub async fn record_result(&self, result: ReadingResult) -> Result<Recorded> {
        let recorded = self
            .db
            .transaction(move |tx| {
                let before = load_session(tx, &result.session_id)?;
                if before.is_completed() {
                    return Err(StudyError::SessionCompleted(before.session_id.clone()));
                }
                if !before.contains_case(&result.case_id) {
                    return Err(StudyError::CaseNotInSession {
                        session_id: before.session_id.clone(),
                        case_id: result.case_id.clone(),
                    });
                }

                let existed = tx.put(&DocRef::result(&result.session_id, &result.case_id), &result)?;
                if existed {
                    return Ok(Recorded {
                        session: before,
                        newly_recorded: false,
                    });
                }

                let mut after = before.clone();
                after.completed_cases = before.completed_cases.checked_add(1).ok_or_else(|| {
                    StudyError::invariant(format!("session {} counter overflow", before.session_id))
                })?;
                check_transition(&before, &after)?;
                tx.put(&DocRef::session(&after.session_id), &after)?;
                Ok(Recorded {
                    session: after,
                    newly_recorded: true,
                })
            })
            .await?;

        if !recorded.newly_recorded {
            warn!(
                "Duplicate submission for session {}; completion count unchanged at {}",
                recorded.session.session_id, recorded.session.completed_cases
            );
        }
        Ok(recorded)
    }

    /// Marks a fully read session completed. Finalizing twice is a no-op.
    pub async fn finalize(&self, session_id: &str) -> Result<Session> {
        let completed_at: DateTime<Utc> = self.clock.now();
        let id = session_id.to_string();
        let session = self
            .db
            .atomic_update(DocRef::session(session_id), move |session: &mut Session| {
                if session.is_completed() {
                    return Ok(session.clone());
                }
                if !session.all_cases_read() {
                    return Err(StudyError::invariant(format!(
                        "session {} finalized with {}/{} cases read",
                        session.session_id, session.completed_cases, session.total_cases
                    )));
                }
                let before = session.clone();
                session.status = SessionStatus::Completed;
                session.completed_at = Some(completed_at);
                check_transition(&before, session)?;
                Ok(session.clone())
            })
            .await?
            .ok_or(StudyError::SessionNotFound(id))?;

        info!(
            "Session {} completed at {}",
            session.session_id,
            session
                .completed_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(session)
    }
}
