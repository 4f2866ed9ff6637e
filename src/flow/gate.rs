//! Pure scheduling rules: condition gating and block arithmetic.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    error::LockReason,
    models::{Condition, Session},
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "gate")]
pub enum StartGate {
    Open,
    AwaitingPrevious { previous: Condition },
    Washout { unlock_at: DateTime<Utc> },
}

impl StartGate {
    pub fn is_open(&self) -> bool {
        matches!(self, StartGate::Open)
    }

    pub fn lock_reason(&self) -> Option<LockReason> {
        match *self {
            StartGate::Open => None,
            StartGate::AwaitingPrevious { previous } => Some(LockReason::AwaitingPrevious(previous)),
            StartGate::Washout { unlock_at } => Some(LockReason::Washout { unlock_at }),
        }
    }
}

pub fn unlock_at(completed_at: DateTime<Utc>, washout: Duration) -> DateTime<Utc> {
    completed_at + washout
}

/// Gate for the condition that follows `previous` in the configured order.
/// The first condition has no predecessor and is always open.
pub fn gate_after(
    previous: Option<(Condition, Option<&Session>)>,
    washout: Duration,
    now: DateTime<Utc>,
) -> StartGate {
    let Some((previous, session)) = previous else {
        return StartGate::Open;
    };
    match session.and_then(|s| s.completed_at.filter(|_| s.is_completed())) {
        None => StartGate::AwaitingPrevious { previous },
        Some(completed_at) => {
            let unlock_at = unlock_at(completed_at, washout);
            if now < unlock_at {
                StartGate::Washout { unlock_at }
            } else {
                StartGate::Open
            }
        }
    }
}

/// True when `next_index` opens a new block of an unfinished session.
pub fn is_block_boundary(next_index: u32, total_cases: u32, block_size: u32) -> bool {
    block_size > 0 && next_index > 0 && next_index < total_cases && next_index % block_size == 0
}

/// 1-based block holding the case at `case_index`.
pub fn block_number(case_index: u32, block_size: u32) -> u32 {
    case_index / block_size.max(1) + 1
}

pub fn total_blocks(total_cases: u32, block_size: u32) -> u32 {
    total_cases.div_ceil(block_size.max(1))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockProgress {
    /// 1-based.
    pub index: u32,
    /// Half-open range `[start, end)` of case indexes.
    pub start: u32,
    pub end: u32,
    pub completed: u32,
    pub status: ProgressStatus,
}

pub fn block_progress(completed_cases: u32, total_cases: u32, block_size: u32) -> Vec<BlockProgress> {
    let size = block_size.max(1);
    (0..total_blocks(total_cases, size))
        .map(|block| {
            let start = block * size;
            let end = (start + size).min(total_cases);
            let status = if completed_cases >= end {
                ProgressStatus::Completed
            } else if completed_cases > start {
                ProgressStatus::InProgress
            } else {
                ProgressStatus::NotStarted
            };
            BlockProgress {
                index: block + 1,
                start,
                end,
                completed: completed_cases.clamp(start, end) - start,
                status,
            }
        })
        .collect()
}
