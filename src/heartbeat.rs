// Background lease renewal - one task per actively-held session

use crate::{
    clock::Clock,
    store::{LockPredicate, LockStore},
};
use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs one renewal loop per actively-held session. Each tick pushes the
/// lock's expiry forward through a conditional write so sweeps never reap
/// a live holder. The scheduler only ever aborts its own tasks - it never
/// deletes lock records, so a crashed holder's lock heals through natural
/// expiry rather than immediate deletion.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    interval: std::time::Duration,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl HeartbeatScheduler {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, interval: std::time::Duration) -> Self {
        Self {
            store,
            clock,
            interval,
            tasks: DashMap::new(),
        }
    }

    /// Start (or restart) the renewal loop for a session. A prior task for
    /// the same session is aborted and replaced.
    pub fn start(&self, session_id: &str, holder_id: &str, lease_token: Uuid, lease_duration: Duration) {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let interval = self.interval;
        let session = session_id.to_string();
        let predicate = LockPredicate::holder_token(holder_id, lease_token);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the lease was just granted
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = clock.now();
                match store
                    .update_expiry(&session, now + lease_duration, now, &predicate)
                    .await
                {
                    Ok(Some(_)) => debug!(session = %session, "heartbeat renewed lease"),
                    // Released, taken over, or expired elsewhere; keep
                    // ticking - the owner of the record decides its fate
                    Ok(None) => debug!(session = %session, "heartbeat found no matching lock"),
                    Err(error) => warn!(session = %session, %error, "heartbeat write failed"),
                }
            }
        });

        if let Some(previous) = self.tasks.insert(session_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Stop the session's renewal loop. The lock record is untouched.
    pub fn stop(&self, session_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(session_id) {
            handle.abort();
        }
    }

    /// Abort every renewal loop, e.g. on process shutdown. Lock records
    /// are untouched and expire naturally.
    pub fn shutdown(&self) {
        let sessions: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for session in sessions {
            self.stop(&session);
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
