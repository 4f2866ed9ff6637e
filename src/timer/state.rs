use serde::{Deserialize, Serialize};

use crate::error::{Result, StudyError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Idle => "idle",
            TimerStatus::Running => "running",
            TimerStatus::Paused => "paused",
            TimerStatus::Stopped => "stopped",
        }
    }
}

/// Advisory band shown next to the clock. Never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerColor {
    Normal,
    Warning,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorThresholds {
    pub warning_secs: u64,
    pub alert_secs: u64,
}

impl Default for ColorThresholds {
    fn default() -> Self {
        Self {
            warning_secs: 30,
            alert_secs: 60,
        }
    }
}

impl ColorThresholds {
    pub fn color_for(&self, elapsed_ms: u64) -> TimerColor {
        let seconds = elapsed_ms / 1000;
        if seconds >= self.alert_secs {
            TimerColor::Alert
        } else if seconds >= self.warning_secs {
            TimerColor::Warning
        } else {
            TimerColor::Normal
        }
    }
}

/// `MM:SS` rendering of whole elapsed seconds.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    let seconds = elapsed_ms / 1000;
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// What survives a reload for the case currently being read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTimer {
    /// Net elapsed ms up to the moment of the snapshot.
    pub accumulated_ms: u64,
    /// Epoch ms at which the snapshot was taken.
    pub resumed_at: i64,
    /// Paused ms accumulated so far for this case.
    pub paused_ms: u64,
    pub pause_count: u32,
}

/// Net time for one case, as reported on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    pub net_ms: u64,
    pub pause_count: u32,
    pub pause_total_ms: u64,
}

/// Pure timer arithmetic; every transition takes the current epoch ms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerState {
    pub status: TimerStatus,
    /// Net ms carried from earlier browsing sessions.
    pub accumulated_ms: u64,
    /// When the current browsing session began counting.
    pub resumed_at_ms: Option<i64>,
    /// Paused ms within the current browsing session.
    pub paused_ms: u64,
    /// Paused ms carried from earlier browsing sessions; reporting only.
    pub carried_paused_ms: u64,
    pub pause_started_at_ms: Option<i64>,
    pub pause_count: u32,
}

fn span(from: i64, to: i64) -> u64 {
    u64::try_from(to.saturating_sub(from)).unwrap_or(0)
}

impl TimerState {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition_error(&self, action: &'static str) -> StudyError {
        StudyError::InvalidTimerTransition {
            from: self.status.as_str(),
            action,
        }
    }

    /// Begins counting, carrying forward `saved` when resuming after a reload.
    pub fn start(&mut self, saved: Option<PersistedTimer>, now_ms: i64) {
        let (accumulated_ms, carried_paused_ms, pause_count) = match saved {
            Some(saved) => (saved.accumulated_ms, saved.paused_ms, saved.pause_count),
            None => (0, 0, 0),
        };
        *self = Self {
            status: TimerStatus::Running,
            accumulated_ms,
            resumed_at_ms: Some(now_ms),
            paused_ms: 0,
            carried_paused_ms,
            pause_started_at_ms: None,
            pause_count,
        };
    }

    pub fn pause(&mut self, now_ms: i64) -> Result<()> {
        if self.status != TimerStatus::Running {
            return Err(self.transition_error("pause"));
        }
        self.pause_started_at_ms = Some(now_ms);
        self.pause_count += 1;
        self.status = TimerStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self, now_ms: i64) -> Result<()> {
        let Some(pause_start) = self.pause_started_at_ms.filter(|_| self.status == TimerStatus::Paused)
        else {
            return Err(self.transition_error("resume"));
        };
        self.paused_ms = self.paused_ms.saturating_add(span(pause_start, now_ms));
        self.pause_started_at_ms = None;
        self.status = TimerStatus::Running;
        Ok(())
    }

    /// Net elapsed ms. An open pause is excluded.
    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        let Some(resumed_at) = self.resumed_at_ms else {
            return self.accumulated_ms;
        };
        let until = match (self.status, self.pause_started_at_ms) {
            (TimerStatus::Paused, Some(pause_start)) => pause_start,
            _ => now_ms,
        };
        self.accumulated_ms
            .saturating_add(span(resumed_at, until).saturating_sub(self.paused_ms))
    }

    pub fn pause_total_ms(&self, now_ms: i64) -> u64 {
        let open = match (self.status, self.pause_started_at_ms) {
            (TimerStatus::Paused, Some(pause_start)) => span(pause_start, now_ms),
            _ => 0,
        };
        self.carried_paused_ms
            .saturating_add(self.paused_ms)
            .saturating_add(open)
    }

    /// Closes any open pause and reports net time. Calling again after a
    /// failed submission recomputes against `now_ms`.
    pub fn stop(&mut self, now_ms: i64) -> Result<TimerReading> {
        match self.status {
            TimerStatus::Idle => return Err(self.transition_error("stop")),
            TimerStatus::Paused => self.resume(now_ms)?,
            TimerStatus::Running | TimerStatus::Stopped => {}
        }
        self.status = TimerStatus::Stopped;
        Ok(TimerReading {
            net_ms: self.elapsed_ms(now_ms),
            pause_count: self.pause_count,
            pause_total_ms: self.pause_total_ms(now_ms),
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_counting(&self) -> bool {
        matches!(self.status, TimerStatus::Running | TimerStatus::Paused)
    }

    pub fn snapshot(&self, now_ms: i64) -> PersistedTimer {
        PersistedTimer {
            accumulated_ms: self.elapsed_ms(now_ms),
            resumed_at: now_ms,
            paused_ms: self.pause_total_ms(now_ms),
            pause_count: self.pause_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn stop_without_pause_reports_wall_time() {
        let mut timer = TimerState::new();
        timer.start(None, T0);
        let reading = timer.stop(T0 + 12_345).unwrap();
        assert_eq!(reading.net_ms, 12_345);
        assert_eq!(reading.pause_count, 0);
        assert_eq!(reading.pause_total_ms, 0);
    }

    #[test]
    fn pause_interval_is_excluded() {
        let mut timer = TimerState::new();
        timer.start(None, T0);
        timer.pause(T0 + 4_000).unwrap();
        assert_eq!(timer.elapsed_ms(T0 + 9_000), 4_000);
        timer.resume(T0 + 10_000).unwrap();
        let reading = timer.stop(T0 + 15_000).unwrap();
        assert_eq!(reading.net_ms, 9_000);
        assert_eq!(reading.pause_count, 1);
        assert_eq!(reading.pause_total_ms, 6_000);
    }

    #[test]
    fn stop_while_paused_closes_the_pause() {
        let mut timer = TimerState::new();
        timer.start(None, T0);
        timer.pause(T0 + 3_000).unwrap();
        let reading = timer.stop(T0 + 8_000).unwrap();
        assert_eq!(reading.net_ms, 3_000);
        assert_eq!(reading.pause_total_ms, 5_000);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut timer = TimerState::new();
        assert!(timer.pause(T0).is_err());
        assert!(timer.resume(T0).is_err());
        assert!(timer.stop(T0).is_err());
        timer.start(None, T0);
        assert!(timer.resume(T0).is_err());
        timer.pause(T0 + 1).unwrap();
        assert!(matches!(
            timer.pause(T0 + 2),
            Err(StudyError::InvalidTimerTransition { from: "paused", action: "pause" })
        ));
    }

    #[test]
    fn restart_from_snapshot_carries_time_forward() {
        let mut timer = TimerState::new();
        timer.start(None, T0);
        timer.pause(T0 + 2_000).unwrap();
        timer.resume(T0 + 3_000).unwrap();
        let saved = timer.snapshot(T0 + 10_000);
        assert_eq!(saved.accumulated_ms, 9_000);

        let mut reloaded = TimerState::new();
        reloaded.start(Some(saved), T0 + 60_000);
        let reading = reloaded.stop(T0 + 61_000).unwrap();
        assert_eq!(reading.net_ms, 10_000);
        assert_eq!(reading.pause_count, 1);
        assert_eq!(reading.pause_total_ms, 1_000);
    }

    #[test]
    fn repeated_stop_recomputes_against_now() {
        let mut timer = TimerState::new();
        timer.start(None, T0);
        assert_eq!(timer.stop(T0 + 1_000).unwrap().net_ms, 1_000);
        assert_eq!(timer.stop(T0 + 1_500).unwrap().net_ms, 1_500);
        timer.reset();
        assert_eq!(timer, TimerState::default());
    }

    #[test]
    fn color_bands_and_display() {
        let bands = ColorThresholds::default();
        assert_eq!(bands.color_for(29_999), TimerColor::Normal);
        assert_eq!(bands.color_for(30_000), TimerColor::Warning);
        assert_eq!(bands.color_for(59_999), TimerColor::Warning);
        assert_eq!(bands.color_for(60_000), TimerColor::Alert);
        assert_eq!(format_elapsed(125_900), "02:05");
    }
}
