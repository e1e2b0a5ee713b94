// Session lock manager - acquisition, release, extension, expiry sweeps,
// conflict detection, and forced takeover

use crate::{
    clock::{default_lock_duration, max_lock_duration, min_lock_duration, Clock},
    error::Error,
    heartbeat::HeartbeatScheduler,
    history::HistoryRecorder,
    lock::{
        LockAction, LockConflict, LockEvent, LockEventKind, LockHistoryEntry, LockKind, LockRecord,
    },
    notify::NotificationSink,
    store::{LockPredicate, LockStore},
    Result,
};
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// How many times an operation re-enters its conditional-write loop after
/// losing a race before giving up.
const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub heartbeat_interval: std::time::Duration,
    /// When true, a same-holder renewal inside acquire appends a history
    /// entry. The originating behavior renews silently.
    pub audit_renewals: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_duration: default_lock_duration(),
            min_duration: min_lock_duration(),
            max_duration: max_lock_duration(),
            heartbeat_interval: std::time::Duration::from_secs(60),
            audit_renewals: false,
        }
    }
}

/// Acquisition either grants a lease or reports the live lease that
/// blocked it. A conflict is an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Granted(LockRecord),
    Conflict(LockConflict),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn record(&self) -> Option<&LockRecord> {
        match self {
            Self::Granted(record) => Some(record),
            Self::Conflict(_) => None,
        }
    }

    pub fn conflict(&self) -> Option<&LockConflict> {
        match self {
            Self::Granted(_) => None,
            Self::Conflict(conflict) => Some(conflict),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockCheck {
    pub record: Option<LockRecord>,
    /// True when the caller holds the lock or no lock exists.
    pub owns_lock: bool,
}

impl LockCheck {
    pub fn is_locked(&self) -> bool {
        self.record.is_some()
    }
}

/// Governs exclusive write access to sessions through time-boxed leases
/// persisted in a [`LockStore`]. Every mutation goes through the store's
/// conditional operations, so two concurrent acquisitions for the same
/// session can never both win. History and notification failures are
/// logged and never turn a completed store mutation into a caller-visible
/// failure.
#[derive(Debug)]
pub struct SessionLockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    history: Arc<dyn HistoryRecorder>,
    notifier: Arc<dyn NotificationSink>,
    heartbeats: HeartbeatScheduler,
    config: LockConfig,
}

impl SessionLockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryRecorder>,
        notifier: Arc<dyn NotificationSink>,
        config: LockConfig,
    ) -> Self {
        let heartbeats =
            HeartbeatScheduler::new(store.clone(), clock.clone(), config.heartbeat_interval);
        Self {
            store,
            clock,
            history,
            notifier,
            heartbeats,
            config,
        }
    }

    /// Acquire a lease on a session.
    ///
    /// Grants a fresh lease when the session is free, refreshes the lease
    /// when the caller already holds it (keeping the lease token), reports
    /// a [`LockConflict`] when another holder's unexpired lease blocks it,
    /// and with `force` revokes the current holder's lease before granting.
    pub async fn acquire(
        &self,
        session_id: &str,
        holder_id: &str,
        kind: LockKind,
        duration: Option<Duration>,
        force: bool,
        metadata: Option<Value>,
    ) -> Result<AcquireOutcome> {
        validate_id("session_id", session_id)?;
        validate_id("holder_id", holder_id)?;
        let duration = self.clamp(duration);

        for _ in 0..ACQUIRE_ATTEMPTS {
            let now = self.clock.now();
            let candidate =
                LockRecord::new(session_id, holder_id, kind, now, duration, metadata.clone());

            if self.store.insert_if_absent(&candidate).await? {
                self.record_history(session_id, holder_id, LockAction::Acquired, kind, None)
                    .await;
                self.publish_session(session_id, LockEventKind::LockAcquired, holder_id, Some(kind), None)
                    .await;
                self.heartbeats
                    .start(session_id, holder_id, candidate.lease_token, duration);
                return Ok(AcquireOutcome::Granted(candidate));
            }

            let Some(existing) = self.store.get_active(session_id).await? else {
                // The blocking record vanished between the insert and the
                // read (released or expired); retry the insert
                continue;
            };

            if existing.holder_id == holder_id {
                // Same holder: treat as renewal, keep the lease token
                let predicate = LockPredicate::holder_token(holder_id, existing.lease_token);
                if let Some(refreshed) = self
                    .store
                    .update_expiry(session_id, now + duration, now, &predicate)
                    .await?
                {
                    if self.config.audit_renewals {
                        self.record_history(
                            session_id,
                            holder_id,
                            LockAction::Acquired,
                            refreshed.kind,
                            Some(json!({ "renewal": true })),
                        )
                        .await;
                    }
                    self.heartbeats
                        .start(session_id, holder_id, refreshed.lease_token, duration);
                    return Ok(AcquireOutcome::Granted(refreshed));
                }
                continue;
            }

            if !force {
                let conflict = LockConflict::from_record(&existing);
                self.record_history(
                    session_id,
                    holder_id,
                    LockAction::Conflict,
                    existing.kind,
                    Some(json!({ "held_by": existing.holder_id })),
                )
                .await;
                return Ok(AcquireOutcome::Conflict(conflict));
            }

            // Forced takeover: revoke the current holder's lease, then
            // re-enter the loop as a fresh acquisition
            let predicate = LockPredicate::holder_token(&existing.holder_id, existing.lease_token);
            if self.store.delete_if_matches(session_id, &predicate).await? {
                self.heartbeats.stop(session_id);
                self.record_history(
                    session_id,
                    holder_id,
                    LockAction::ForcedRelease,
                    existing.kind,
                    Some(json!({ "displaced_holder": existing.holder_id })),
                )
                .await;
                let event = self.event(
                    LockEventKind::LockForced,
                    session_id,
                    holder_id,
                    Some(existing.kind),
                    Some(format!("Your lock was forcibly taken over by {holder_id}")),
                );
                if let Err(error) = self.notifier.publish_to_holder(&existing.holder_id, event).await {
                    warn!(session = %session_id, %error, "forced-takeover notification failed");
                }
            }
        }

        Err(Error::Contention {
            session_id: session_id.to_string(),
        })
    }

    /// Release the caller's lease. Returns true on release or when no lock
    /// exists; false when the caller is not the holder or the provided
    /// lease token does not match.
    pub async fn release(
        &self,
        session_id: &str,
        holder_id: &str,
        lease_token: Option<Uuid>,
    ) -> Result<bool> {
        validate_id("session_id", session_id)?;
        validate_id("holder_id", holder_id)?;

        let Some(existing) = self.store.get_active(session_id).await? else {
            return Ok(true);
        };
        if existing.holder_id != holder_id {
            return Ok(false);
        }
        if let Some(token) = lease_token {
            if existing.lease_token != token {
                return Ok(false);
            }
        }

        let predicate = LockPredicate::holder_token(holder_id, existing.lease_token);
        if !self.store.delete_if_matches(session_id, &predicate).await? {
            return Ok(false);
        }

        self.heartbeats.stop(session_id);
        self.record_history(session_id, holder_id, LockAction::Released, existing.kind, None)
            .await;
        self.publish_session(
            session_id,
            LockEventKind::LockReleased,
            holder_id,
            Some(existing.kind),
            None,
        )
        .await;
        Ok(true)
    }

    /// Report the session's lock state. An expired resident record is
    /// cleaned up the same way passive expiry cleans it, then reported
    /// absent.
    pub async fn check(&self, session_id: &str, holder_id: Option<&str>) -> Result<LockCheck> {
        validate_id("session_id", session_id)?;
        let now = self.clock.now();

        let Some(record) = self.store.get_any(session_id).await? else {
            return Ok(LockCheck {
                record: None,
                owns_lock: true,
            });
        };

        if record.is_expired(now) {
            self.cleanup_expired(&record).await?;
            return Ok(LockCheck {
                record: None,
                owns_lock: true,
            });
        }

        let owns_lock = holder_id.is_some_and(|h| h == record.holder_id);
        Ok(LockCheck {
            record: Some(record),
            owns_lock,
        })
    }

    /// Push the lease's expiry forward. Fails (returns None) unless the
    /// caller is the holder with a matching lease token. Never shortens
    /// the lease; the new expiry is capped at `now + max_duration`.
    pub async fn extend(
        &self,
        session_id: &str,
        holder_id: &str,
        lease_token: Uuid,
        additional: Duration,
    ) -> Result<Option<LockRecord>> {
        validate_id("session_id", session_id)?;
        validate_id("holder_id", holder_id)?;
        let additional = self.clamp(Some(additional));
        let now = self.clock.now();

        let Some(existing) = self.store.get_active(session_id).await? else {
            return Ok(None);
        };
        if existing.holder_id != holder_id || existing.lease_token != lease_token {
            return Ok(None);
        }

        let new_expiry = (now + additional).max(existing.expires_at);
        let predicate = LockPredicate::holder_token(holder_id, lease_token);
        self.store
            .update_expiry(session_id, new_expiry, now, &predicate)
            .await
    }

    /// All unexpired locks held by one holder.
    pub async fn list_by_holder(&self, holder_id: &str) -> Result<Vec<LockRecord>> {
        validate_id("holder_id", holder_id)?;
        self.store.list_active_by_holder(holder_id).await
    }

    /// Reap every expired lock record. Each cleanup is a conditional
    /// delete-if-still-expired, so concurrent sweeps across processes
    /// tolerate double-cleanup: the loser observes "already gone".
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut reaped = 0;
        for record in self.store.list_all_expired().await? {
            if self.cleanup_expired(&record).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Stop all heartbeat loops without touching lock records; held leases
    /// expire naturally.
    pub fn shutdown(&self) {
        self.heartbeats.shutdown();
    }

    pub fn heartbeats(&self) -> &HeartbeatScheduler {
        &self.heartbeats
    }

    async fn cleanup_expired(&self, record: &LockRecord) -> Result<bool> {
        let now = self.clock.now();
        let predicate = LockPredicate::expired_token(record.lease_token, now);
        if !self
            .store
            .delete_if_matches(&record.session_id, &predicate)
            .await?
        {
            // Another sweeper got here first, or the lease was refreshed
            return Ok(false);
        }

        self.heartbeats.stop(&record.session_id);
        self.record_history(
            &record.session_id,
            &record.holder_id,
            LockAction::Expired,
            record.kind,
            None,
        )
        .await;
        self.publish_session(
            &record.session_id,
            LockEventKind::LockExpired,
            &record.holder_id,
            Some(record.kind),
            None,
        )
        .await;
        Ok(true)
    }

    fn clamp(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.config.default_duration)
            .clamp(self.config.min_duration, self.config.max_duration)
    }

    fn event(
        &self,
        kind: LockEventKind,
        session_id: &str,
        actor: &str,
        lock_kind: Option<LockKind>,
        message: Option<String>,
    ) -> LockEvent {
        LockEvent {
            kind,
            session_id: session_id.to_string(),
            actor: actor.to_string(),
            lock_kind,
            timestamp: self.clock.now(),
            message,
        }
    }

    async fn record_history(
        &self,
        session_id: &str,
        actor_id: &str,
        action: LockAction,
        kind: LockKind,
        metadata: Option<Value>,
    ) {
        let entry = LockHistoryEntry {
            session_id: session_id.to_string(),
            actor_id: actor_id.to_string(),
            action,
            kind,
            metadata,
            timestamp: self.clock.now(),
        };
        if let Err(error) = self.history.append(entry).await {
            warn!(session = %session_id, %error, "history append failed");
        }
    }

    async fn publish_session(
        &self,
        session_id: &str,
        kind: LockEventKind,
        actor: &str,
        lock_kind: Option<LockKind>,
        message: Option<String>,
    ) {
        let event = self.event(kind, session_id, actor, lock_kind, message);
        if let Err(error) = self.notifier.publish_to_session(session_id, event).await {
            warn!(session = %session_id, %error, "notification publish failed");
        }
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}
