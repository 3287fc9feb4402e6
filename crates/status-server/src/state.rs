//! Application state

use drift_engine::SnapshotHandle;

pub struct AppState {
    /// Latest published cycle, swapped by the scheduler after every run
    pub snapshot: SnapshotHandle,
}

impl AppState {
    pub fn new(snapshot: SnapshotHandle) -> Self {
        Self { snapshot }
    }
}
