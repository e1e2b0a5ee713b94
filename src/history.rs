use crate::{
    lock::{LockAction, LockHistoryEntry},
    Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Append-only audit sink for lock lifecycle events. Append failures are
/// logged by the caller and never fail the primary operation.
#[async_trait]
pub trait HistoryRecorder: Send + Sync + std::fmt::Debug {
    async fn append(&self, entry: LockHistoryEntry) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryHistoryRecorder {
    entries: Mutex<Vec<LockHistoryEntry>>,
}

impl MemoryHistoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<LockHistoryEntry> {
        self.entries.lock().clone()
    }

    pub fn for_session(&self, session_id: &str) -> Vec<LockHistoryEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn count(&self, session_id: &str, action: LockAction) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.session_id == session_id && entry.action == action)
            .count()
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistoryRecorder {
    async fn append(&self, entry: LockHistoryEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
