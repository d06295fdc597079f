use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Process-wide scheduler state. Created once at startup, mutated only by
/// the scheduler's own methods, never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerState {
    pub running: bool,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub total_collections: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Devices whose collection is currently executing.
    pub in_flight: HashSet<String>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }
}
