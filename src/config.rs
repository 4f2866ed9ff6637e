use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Duration as ChronoDuration;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StudyError},
    models::Condition,
    timer::{ColorThresholds, TimerSettings},
};

pub const CONFIG_ENV_VAR: &str = "READER_STUDY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StudyConfig {
    /// Conditions in the order a reader must complete them.
    pub condition_order: Vec<Condition>,
    pub washout_days: i64,
    pub block_size: u32,
    pub timer_warning_secs: u64,
    pub timer_alert_secs: u64,
    pub timer_tick_ms: u64,
    pub timer_key_prefix: String,
    pub database_path: PathBuf,
    pub local_state_path: PathBuf,
    pub super_admin_emails: Vec<String>,
    pub transaction_retries: u32,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            condition_order: Condition::ALL.to_vec(),
            washout_days: 14,
            block_size: 50,
            timer_warning_secs: 30,
            timer_alert_secs: 60,
            timer_tick_ms: 1000,
            timer_key_prefix: "reading_timer".into(),
            database_path: PathBuf::from("reader-study.sqlite3"),
            local_state_path: PathBuf::from("reader-study-local.json"),
            super_admin_emails: Vec::new(),
            transaction_retries: 5,
        }
    }
}

impl StudyConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No study config at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|err| {
            StudyError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|err| {
            StudyError::Config(format!("invalid study config {}: {err}", path.display()))
        })?;
        config.validate()?;
        info!("Loaded study config from {}", path.display());
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        match env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(StudyError::Config("block_size must be at least 1".into()));
        }
        if self.washout_days < 0 {
            return Err(StudyError::Config(format!(
                "washout_days must not be negative (got {})",
                self.washout_days
            )));
        }
        if self.condition_order.is_empty() {
            return Err(StudyError::Config("condition_order is empty".into()));
        }
        let unique: HashSet<Condition> = self.condition_order.iter().copied().collect();
        if unique.len() != self.condition_order.len() {
            return Err(StudyError::Config(
                "condition_order lists a condition twice".into(),
            ));
        }
        if self.timer_alert_secs < self.timer_warning_secs {
            return Err(StudyError::Config(
                "timer_alert_secs must not be below timer_warning_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn washout(&self) -> ChronoDuration {
        ChronoDuration::days(self.washout_days)
    }

    pub fn timer_settings(&self) -> TimerSettings {
        TimerSettings {
            key_prefix: self.timer_key_prefix.clone(),
            tick_interval: Duration::from_millis(self.timer_tick_ms.max(1)),
            thresholds: ColorThresholds {
                warning_secs: self.timer_warning_secs,
                alert_secs: self.timer_alert_secs,
            },
            ..TimerSettings::default()
        }
    }
}
