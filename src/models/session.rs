//! Session records: one reader's run through one condition.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Condition, ExperienceLevel};
use crate::error::{Result, StudyError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub reader_id: String,
    pub facility: String,
    pub reader_level: ExperienceLevel,
    #[serde(rename = "task_type")]
    pub condition: Condition,
    pub shuffle_seed: u32,
    /// Materialized once at creation, never recomputed.
    pub case_order: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_practice: bool,
    pub total_cases: u32,
    pub completed_cases: u32,
    pub status: SessionStatus,
}

/// Converts a length or position to the stored `u32` width.
pub(crate) fn count_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StudyError::invariant(format!("{what} {value} does not fit in u32")))
}

impl Session {
    /// Index of the next unread case. Derived from `completed_cases` only.
    pub fn next_case_index(&self) -> u32 {
        self.completed_cases
    }

    pub fn current_case(&self) -> Option<&str> {
        if self.is_completed() {
            return None;
        }
        self.case_order
            .get(self.next_case_index() as usize)
            .map(String::as_str)
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn all_cases_read(&self) -> bool {
        self.completed_cases >= self.total_cases
    }

    pub fn contains_case(&self, case_id: &str) -> bool {
        self.case_order.iter().any(|c| c == case_id)
    }

    /// 1-based position of `case_id` within the session's order.
    pub fn case_position(&self, case_id: &str) -> Result<Option<u32>> {
        self.case_order
            .iter()
            .position(|c| c == case_id)
            .map(|idx| count_u32(idx + 1, "case position"))
            .transpose()
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.total_cases == 0 {
            0.0
        } else {
            f64::from(self.completed_cases) / f64::from(self.total_cases)
        }
    }

    /// Structural checks shared by every write path.
    pub fn check_invariants(&self) -> Result<()> {
        if self.completed_cases > self.total_cases {
            return Err(StudyError::invariant(format!(
                "session {} has completed_cases {} > total_cases {}",
                self.session_id, self.completed_cases, self.total_cases
            )));
        }
        if self.case_order.len() != self.total_cases as usize {
            return Err(StudyError::invariant(format!(
                "session {} case_order has {} entries but total_cases is {}",
                self.session_id,
                self.case_order.len(),
                self.total_cases
            )));
        }
        let unique: HashSet<&str> = self.case_order.iter().map(String::as_str).collect();
        if unique.len() != self.case_order.len() {
            return Err(StudyError::invariant(format!(
                "session {} case_order contains duplicates",
                self.session_id
            )));
        }
        match (self.status, self.completed_at) {
            (SessionStatus::Completed, None) => Err(StudyError::invariant(format!(
                "session {} is completed without completed_at",
                self.session_id
            ))),
            (SessionStatus::InProgress, Some(_)) => Err(StudyError::invariant(format!(
                "session {} has completed_at while in progress",
                self.session_id
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_session(case_order: &[&str]) -> Session {
    Session {
        session_id: "session-1".into(),
        reader_id: "OSK_001".into(),
        facility: "Osaka".into(),
        reader_level: ExperienceLevel::Specialist,
        condition: Condition::Unaided,
        shuffle_seed: 7,
        case_order: case_order.iter().map(|c| c.to_string()).collect(),
        started_at: Utc::now(),
        completed_at: None,
        is_practice: false,
        total_cases: case_order.len() as u32,
        completed_cases: 0,
        status: SessionStatus::InProgress,
    }
}
