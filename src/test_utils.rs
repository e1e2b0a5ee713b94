use crate::{
    clock::Clock,
    history::MemoryHistoryRecorder,
    manager::{LockConfig, SessionLockManager},
    notify::ChannelNotifier,
    store::{MemoryLockStore, MemoryVersionedStore},
    update::OptimisticUpdateCoordinator,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Clock that only moves when told to, for deterministic expiry tests.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// A lock manager wired to in-memory backends, with handles to every
/// collaborator so tests can inspect and steer them.
#[derive(Debug)]
pub struct TestHarness {
    pub manager: SessionLockManager,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryLockStore>,
    pub history: Arc<MemoryHistoryRecorder>,
    pub notifier: Arc<ChannelNotifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryLockStore::new(clock.clone()));
        let history = Arc::new(MemoryHistoryRecorder::new());
        let notifier = Arc::new(ChannelNotifier::new());
        let manager = SessionLockManager::new(
            store.clone(),
            clock.clone(),
            history.clone(),
            notifier.clone(),
            config,
        );
        Self {
            manager,
            clock,
            store,
            history,
            notifier,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// An update coordinator over a fresh in-memory versioned store, with the
/// store handle kept for direct inspection.
pub fn coordinator_harness() -> (OptimisticUpdateCoordinator, Arc<MemoryVersionedStore>) {
    let store = Arc::new(MemoryVersionedStore::new());
    (OptimisticUpdateCoordinator::new(store.clone()), store)
}
