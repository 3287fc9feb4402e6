//! Copy-on-publish view of the last completed cycle
//!
//! The scheduler publishes a fresh [`CycleSnapshot`] after every cycle;
//! readers clone the `Arc` and never observe a half-built inventory.

use crate::inventory::ImageRecord;
use crate::notifier::DotStyle;
use crate::schedule::RunKind;
use chrono::{DateTime, Local, NaiveTime};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTime {
    pub time: NaiveTime,
    pub kind: RunKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSnapshot {
    pub images: Vec<ImageRecord>,
    pub last_checked: Option<DateTime<Local>>,
    pub next_run: Option<DateTime<Local>>,
    pub schedule: Vec<ScheduledTime>,
    pub dots: DotStyle,
}

impl CycleSnapshot {
    pub fn empty(dots: DotStyle) -> Self {
        Self {
            images: Vec::new(),
            last_checked: None,
            next_run: None,
            schedule: Vec::new(),
            dots,
        }
    }
}

#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<CycleSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new(initial: CycleSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn publish(&self, snapshot: CycleSnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }

    pub fn latest(&self) -> Arc<CycleSnapshot> {
        self.inner.read().clone()
    }

    /// Publishes a copy of the current snapshot with `f` applied.
    pub fn update(&self, f: impl FnOnce(&mut CycleSnapshot)) {
        let mut next = (*self.latest()).clone();
        f(&mut next);
        self.publish(next);
    }
}
