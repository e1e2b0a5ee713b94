// Lock data model - records, conflicts, history entries, and events

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// A time-boxed grant of write access to one session.
///
/// At most one unexpired record exists per session id; the store's
/// conditional writes enforce that, not the reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub session_id: String,
    pub holder_id: String,
    pub kind: LockKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Unique per acquisition; a renewal keeps the token, a takeover mints
    /// a new one.
    pub lease_token: Uuid,
    pub last_activity_at: DateTime<Utc>,
    pub client_metadata: Option<Value>,
}

impl LockRecord {
    pub fn new(
        session_id: &str,
        holder_id: &str,
        kind: LockKind,
        now: DateTime<Utc>,
        duration: Duration,
        client_metadata: Option<Value>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            holder_id: holder_id.to_string(),
            kind,
            acquired_at: now,
            expires_at: now + duration,
            lease_token: Uuid::new_v4(),
            last_activity_at: now,
            client_metadata,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.expires_at > now {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }
}

/// Returned when acquisition fails against another holder's live lease.
/// Transient - constructed on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConflict {
    pub holder_id: String,
    pub kind: LockKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Ready to display to the blocked caller.
    pub message: String,
}

impl LockConflict {
    pub fn from_record(record: &LockRecord) -> Self {
        Self {
            holder_id: record.holder_id.clone(),
            kind: record.kind,
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
            message: format!(
                "Session is locked by {} until {}",
                record.holder_id,
                record.expires_at.to_rfc3339()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockAction {
    Acquired,
    Released,
    Expired,
    ForcedRelease,
    Conflict,
}

/// Append-only audit entry. Never mutated or deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHistoryEntry {
    pub session_id: String,
    pub actor_id: String,
    pub action: LockAction,
    pub kind: LockKind,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    LockAcquired,
    LockReleased,
    LockForced,
    LockExpired,
}

/// Fan-out payload for live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    pub kind: LockEventKind,
    pub session_id: String,
    pub actor: String,
    pub lock_kind: Option<LockKind>,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}
