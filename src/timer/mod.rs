pub mod controller;
pub mod state;

pub use controller::{TimerController, TimerSettings, TimerSnapshot};
pub use state::{ColorThresholds, PersistedTimer, TimerColor, TimerReading, TimerState, TimerStatus};
