//! Reading session engine for a multi-reader imaging study.

pub mod allocator;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod flow;
pub mod local;
pub mod models;
pub mod roles;
pub mod session;
pub mod shuffle;
pub mod timer;

pub use allocator::{ReaderIdAllocator, ReaderRegistry, Registration};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StudyConfig;
pub use db::Database;
pub use error::{Result, StudyError};
pub use flow::{FlowStep, ReadingStep, StudyFlow};
pub use local::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use roles::{Role, RoleResolver};
pub use session::SessionLifecycle;
pub use timer::TimerController;

const DEBUG_ENV_VAR: &str = "READER_STUDY_DEBUG";

/// Installs `env_logger`. `RUST_LOG` wins; otherwise the level is `info`, or
/// `debug` when `READER_STUDY_DEBUG=1`.
pub fn init_logging() {
    let default_level = match std::env::var(DEBUG_ENV_VAR).as_deref() {
        Ok("1") => "debug",
        _ => "info",
    };
    let initialized = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .try_init();

    if initialized.is_ok() {
        log::info!("Reader study engine starting up...");
    }
}
