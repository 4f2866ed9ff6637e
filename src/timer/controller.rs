use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};

use crate::{clock::Clock, error::Result, local::LocalStore};

use super::{
    state::{format_elapsed, ColorThresholds, PersistedTimer, TimerColor, TimerReading},
    TimerState, TimerStatus,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub status: TimerStatus,
    pub elapsed_ms: u64,
    pub display: String,
    pub color: TimerColor,
    pub pause_count: u32,
    pub pause_total_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TimerSettings {
    pub key_prefix: String,
    pub tick_interval: Duration,
    /// Every this many ticks the running state is snapshotted locally.
    pub persist_every_ticks: u32,
    pub thresholds: ColorThresholds,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            key_prefix: "reading_timer".into(),
            tick_interval: Duration::from_secs(1),
            persist_every_ticks: 10,
            thresholds: ColorThresholds::default(),
        }
    }
}

struct TimerInner {
    timer: TimerState,
    persist_key: Option<String>,
}

/// Reading timer for the case on screen, recoverable across reloads.
#[derive(Clone)]
pub struct TimerController {
    inner: Arc<Mutex<TimerInner>>,
    local: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    updates: watch::Sender<TimerSnapshot>,
    settings: Arc<TimerSettings>,
}

fn storage_key(prefix: &str, key: &str) -> String {
    format!("{prefix}_{key}")
}

fn build_snapshot(timer: &TimerState, now_ms: i64, thresholds: &ColorThresholds) -> TimerSnapshot {
    let elapsed_ms = timer.elapsed_ms(now_ms);
    TimerSnapshot {
        status: timer.status,
        elapsed_ms,
        display: format_elapsed(elapsed_ms),
        color: thresholds.color_for(elapsed_ms),
        pause_count: timer.pause_count,
        pause_total_ms: timer.pause_total_ms(now_ms),
    }
}

/// Local persistence is best-effort; failures are logged and swallowed.
fn save_local(local: &dyn LocalStore, key: &str, state: &PersistedTimer) {
    let result = serde_json::to_string(state)
        .map_err(anyhow::Error::new)
        .and_then(|json| local.persist(key, &json));
    if let Err(err) = result {
        warn!("Failed to persist timer state {key}: {err:#}");
    }
}

fn load_local(local: &dyn LocalStore, key: &str) -> Option<PersistedTimer> {
    match local.load(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("Ignoring unreadable timer state {key}: {err}");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!("Failed to load timer state {key}: {err:#}");
            None
        }
    }
}

fn clear_local(local: &dyn LocalStore, key: &str) {
    if let Err(err) = local.clear(key) {
        warn!("Failed to clear timer state {key}: {err:#}");
    }
}

impl TimerController {
    pub fn new(local: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, settings: TimerSettings) -> Self {
        let idle = build_snapshot(&TimerState::new(), clock.now_ms(), &settings.thresholds);
        let (updates, _) = watch::channel(idle);
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                timer: TimerState::new(),
                persist_key: None,
            })),
            local,
            clock,
            ticker: Arc::new(Mutex::new(None)),
            updates,
            settings: Arc::new(settings),
        }
    }

    /// Receives a fresh snapshot on every transition and tick.
    pub fn subscribe(&self) -> watch::Receiver<TimerSnapshot> {
        self.updates.subscribe()
    }

    pub async fn get_snapshot(&self) -> TimerSnapshot {
        let guard = self.inner.lock().await;
        build_snapshot(&guard.timer, self.clock.now_ms(), &self.settings.thresholds)
    }

    pub async fn status(&self) -> TimerStatus {
        self.inner.lock().await.timer.status
    }

    /// Starts counting. With a `persist_key` that has saved state, counting
    /// resumes from the saved net time.
    pub async fn start(&self, persist_key: Option<&str>) -> Result<TimerSnapshot> {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            let now = self.clock.now_ms();
            let key = persist_key.map(|k| storage_key(&self.settings.key_prefix, k));
            let saved = key
                .as_deref()
                .and_then(|k| load_local(self.local.as_ref(), k));
            if let (Some(k), Some(saved)) = (key.as_deref(), saved.as_ref()) {
                info!(
                    "Recovered timer {k}: {} ms already spent, {} pauses",
                    saved.accumulated_ms, saved.pause_count
                );
            }
            guard.timer.start(saved, now);
            if let Some(k) = key.as_deref() {
                save_local(self.local.as_ref(), k, &guard.timer.snapshot(now));
            }
            guard.persist_key = key;
            build_snapshot(&guard.timer, now, &self.settings.thresholds)
        };

        self.spawn_ticker().await;
        self.updates.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn pause(&self) -> Result<TimerSnapshot> {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            let now = self.clock.now_ms();
            guard.timer.pause(now)?;
            if let Some(key) = guard.persist_key.as_deref() {
                save_local(self.local.as_ref(), key, &guard.timer.snapshot(now));
            }
            build_snapshot(&guard.timer, now, &self.settings.thresholds)
        };
        self.updates.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn resume(&self) -> Result<TimerSnapshot> {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            let now = self.clock.now_ms();
            guard.timer.resume(now)?;
            build_snapshot(&guard.timer, now, &self.settings.thresholds)
        };
        self.spawn_ticker().await;
        self.updates.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Stops counting and clears saved state for the key. The timer keeps
    /// its anchors, so a second `stop` after a failed save measures up to the
    /// new instant.
    pub async fn stop(&self) -> Result<TimerReading> {
        let (reading, snapshot) = {
            let mut guard = self.inner.lock().await;
            let now = self.clock.now_ms();
            let reading = guard.timer.stop(now)?;
            if let Some(key) = guard.persist_key.as_deref() {
                clear_local(self.local.as_ref(), key);
            }
            (
                reading,
                build_snapshot(&guard.timer, now, &self.settings.thresholds),
            )
        };
        self.cancel_ticker().await;
        self.updates.send_replace(snapshot);
        debug!("Timer stopped at {} ms net", reading.net_ms);
        Ok(reading)
    }

    pub async fn reset(&self) {
        let snapshot = {
            let mut guard = self.inner.lock().await;
            guard.timer.reset();
            if let Some(key) = guard.persist_key.take() {
                clear_local(self.local.as_ref(), &key);
            }
            build_snapshot(&guard.timer, self.clock.now_ms(), &self.settings.thresholds)
        };
        self.cancel_ticker().await;
        self.updates.send_replace(snapshot);
    }

    /// Saves a stopped timer again so a reload can still recover its time.
    /// Used when the stopped reading could not be recorded.
    pub async fn retain_stopped(&self) {
        let guard = self.inner.lock().await;
        if guard.timer.status != TimerStatus::Stopped {
            return;
        }
        if let Some(key) = guard.persist_key.as_deref() {
            save_local(self.local.as_ref(), key, &guard.timer.snapshot(self.clock.now_ms()));
        }
    }

    /// Snapshot written when the page is about to be discarded.
    pub async fn persist_on_unload(&self) {
        let guard = self.inner.lock().await;
        if !guard.timer.is_counting() {
            return;
        }
        if let Some(key) = guard.persist_key.as_deref() {
            save_local(self.local.as_ref(), key, &guard.timer.snapshot(self.clock.now_ms()));
        }
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let inner = Arc::downgrade(&self.inner);
        let local = self.local.clone();
        let clock = self.clock.clone();
        let updates = self.updates.clone();
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(settings.tick_interval);
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;

                // The controller is gone once every strong handle is dropped.
                let Some(state) = inner.upgrade() else {
                    break;
                };
                let guard = state.lock_owned().await;
                if guard.timer.status != TimerStatus::Running {
                    break;
                }
                let now = clock.now_ms();
                let snapshot = build_snapshot(&guard.timer, now, &settings.thresholds);

                ticks = ticks.wrapping_add(1);
                let heartbeat_due =
                    settings.persist_every_ticks > 0 && ticks % settings.persist_every_ticks == 0;
                if heartbeat_due && guard.persist_key.is_some() {
                    // The write holds the guard; stop and reset wait for it.
                    let local = local.clone();
                    let write = tokio::task::spawn_blocking(move || {
                        if let Some(key) = guard.persist_key.as_deref() {
                            save_local(local.as_ref(), key, &guard.timer.snapshot(now));
                        }
                    });
                    if let Err(err) = write.await {
                        warn!("Timer heartbeat write did not complete: {err}");
                    }
                } else {
                    drop(guard);
                }

                updates.send_replace(snapshot);
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        error::StudyError,
        local::{FileLocalStore, MemoryLocalStore},
    };
    use chrono::{TimeZone, Utc};

    fn controller() -> (TimerController, ManualClock, Arc<MemoryLocalStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let local = Arc::new(MemoryLocalStore::new());
        let settings = TimerSettings {
            tick_interval: Duration::from_millis(5),
            persist_every_ticks: 1,
            ..TimerSettings::default()
        };
        let controller = TimerController::new(local.clone(), Arc::new(clock.clone()), settings);
        (controller, clock, local)
    }

    #[tokio::test]
    async fn pause_persists_and_reload_resumes() {
        let (timer, clock, local) = controller();
        timer.start(Some("s1_0")).await.unwrap();
        clock.advance_ms(7_000);
        timer.pause().await.unwrap();
        assert_eq!(local.keys(), vec!["reading_timer_s1_0".to_string()]);

        // A fresh controller stands in for the reloaded page.
        let reloaded = TimerController::new(
            local.clone(),
            Arc::new(clock.clone()),
            TimerSettings::default(),
        );
        clock.advance_ms(120_000);
        let snapshot = reloaded.start(Some("s1_0")).await.unwrap();
        assert_eq!(snapshot.elapsed_ms, 7_000);
        assert_eq!(snapshot.pause_count, 1);

        clock.advance_ms(3_000);
        let reading = reloaded.stop().await.unwrap();
        assert_eq!(reading.net_ms, 10_000);
        assert!(local.keys().is_empty());
    }

    #[tokio::test]
    async fn stop_clears_saved_state_for_key() {
        let (timer, clock, local) = controller();
        timer.start(Some("s_0")).await.unwrap();
        clock.advance_ms(5_000);
        timer.pause().await.unwrap();
        timer.resume().await.unwrap();
        timer.stop().await.unwrap();
        assert!(local.keys().is_empty());

        let next = TimerController::new(
            local.clone(),
            Arc::new(clock.clone()),
            TimerSettings::default(),
        );
        let snapshot = next.start(Some("s_0")).await.unwrap();
        assert_eq!(snapshot.elapsed_ms, 0);
        assert_eq!(snapshot.pause_count, 0);
        next.reset().await;
    }

    #[tokio::test]
    async fn retained_stop_survives_reload() {
        let (timer, clock, local) = controller();
        timer.start(Some("s_1")).await.unwrap();
        clock.advance_ms(8_000);
        timer.stop().await.unwrap();
        timer.retain_stopped().await;
        assert_eq!(local.keys(), vec!["reading_timer_s_1".to_string()]);

        let reloaded = TimerController::new(
            local.clone(),
            Arc::new(clock.clone()),
            TimerSettings::default(),
        );
        let snapshot = reloaded.start(Some("s_1")).await.unwrap();
        assert_eq!(snapshot.elapsed_ms, 8_000);
        reloaded.reset().await;
        timer.reset().await;
        assert!(local.keys().is_empty());
    }

    #[tokio::test]
    async fn pause_resume_excludes_paused_span() {
        let (timer, clock, _) = controller();
        timer.start(None).await.unwrap();
        clock.advance_ms(5_000);
        timer.pause().await.unwrap();
        clock.advance_ms(2_500);
        timer.resume().await.unwrap();
        clock.advance_ms(1_000);
        let reading = timer.stop().await.unwrap();
        assert_eq!(reading.net_ms, 6_000);
        assert_eq!(reading.pause_total_ms, 2_500);
    }

    #[tokio::test]
    async fn unload_snapshot_and_reset() {
        let (timer, clock, local) = controller();
        timer.start(Some("s2_4")).await.unwrap();
        clock.advance_ms(42_000);
        timer.persist_on_unload().await;
        let raw = local.load("reading_timer_s2_4").unwrap().unwrap();
        let saved: PersistedTimer = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.accumulated_ms, 42_000);

        assert_eq!(timer.get_snapshot().await.color, TimerColor::Warning);
        timer.reset().await;
        assert!(local.keys().is_empty());
        assert_eq!(timer.status().await, TimerStatus::Idle);
    }

    #[tokio::test]
    async fn resume_without_pause_is_an_error() {
        let (timer, _, _) = controller();
        timer.start(None).await.unwrap();
        assert!(matches!(
            timer.resume().await,
            Err(StudyError::InvalidTimerTransition { .. })
        ));
        timer.reset().await;
    }

    #[tokio::test]
    async fn ticker_publishes_running_snapshots() {
        let (timer, clock, local) = controller();
        let mut rx = timer.subscribe();
        timer.start(Some("tick")).await.unwrap();
        clock.advance_ms(61_000);

        let observed = time::timeout(Duration::from_secs(2), async {
            loop {
                rx.changed().await.unwrap();
                let snapshot = rx.borrow_and_update().clone();
                if snapshot.elapsed_ms == 61_000 {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(observed.color, TimerColor::Alert);
        assert_eq!(observed.display, "01:01");

        let raw = local.load("reading_timer_tick").unwrap().unwrap();
        let saved: PersistedTimer = serde_json::from_str(&raw).unwrap();
        assert!(saved.accumulated_ms <= 61_000);
        timer.reset().await;
    }

    #[tokio::test]
    async fn file_heartbeats_stay_consistent_with_stop() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(FileLocalStore::new(dir.path().join("local.json")).unwrap());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let settings = TimerSettings {
            tick_interval: Duration::from_millis(2),
            persist_every_ticks: 1,
            ..TimerSettings::default()
        };
        let timer = TimerController::new(local.clone(), Arc::new(clock.clone()), settings);

        timer.start(Some("disk")).await.unwrap();
        clock.advance_ms(12_000);
        time::sleep(Duration::from_millis(30)).await;
        let raw = local.load("reading_timer_disk").unwrap().unwrap();
        let saved: PersistedTimer = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.accumulated_ms, 12_000);
        assert_eq!(timer.get_snapshot().await.elapsed_ms, 12_000);

        timer.stop().await.unwrap();
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(local.load("reading_timer_disk").unwrap(), None);
        let reopened = FileLocalStore::new(dir.path().join("local.json")).unwrap();
        assert_eq!(reopened.load("reading_timer_disk").unwrap(), None);
    }
}
