use std::sync::Arc;
use std::time::Instant;
use timemachine_core::config::{ConfigLoader, Settings};
use timemachine_core::schedule::ScheduleEngine;

pub struct AppState {
    /// Settings are re-read per request so edits apply without a restart
    pub loader: ConfigLoader,
    pub schedules: Arc<ScheduleEngine>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(loader: ConfigLoader, schedules: Arc<ScheduleEngine>) -> Self {
        Self {
            loader,
            schedules,
            started_at: Instant::now(),
        }
    }

    pub fn settings(&self) -> timemachine_core::Result<Settings> {
        self.loader.load()
    }
}
