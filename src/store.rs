use crate::{clock::Clock, lock::LockRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Conditions a conditional delete or expiry update must satisfy.
/// Every set field must hold against the stored record.
#[derive(Debug, Clone, Default)]
pub struct LockPredicate {
    pub holder_id: Option<String>,
    pub lease_token: Option<Uuid>,
    /// Matches only records whose expiry is at or before this instant.
    pub expired_as_of: Option<DateTime<Utc>>,
}

impl LockPredicate {
    pub fn holder_token(holder_id: &str, lease_token: Uuid) -> Self {
        Self {
            holder_id: Some(holder_id.to_string()),
            lease_token: Some(lease_token),
            expired_as_of: None,
        }
    }

    pub fn expired_token(lease_token: Uuid, as_of: DateTime<Utc>) -> Self {
        Self {
            holder_id: None,
            lease_token: Some(lease_token),
            expired_as_of: Some(as_of),
        }
    }

    pub fn matches(&self, record: &LockRecord) -> bool {
        if let Some(holder_id) = &self.holder_id {
            if record.holder_id != *holder_id {
                return false;
            }
        }
        if let Some(lease_token) = self.lease_token {
            if record.lease_token != lease_token {
                return false;
            }
        }
        if let Some(as_of) = self.expired_as_of {
            if record.expires_at > as_of {
                return false;
            }
        }
        true
    }
}

/// Persistence for lock records. Every mutation is conditional so two
/// concurrent callers can never both observe "absent" and both win.
#[async_trait]
pub trait LockStore: Send + Sync + std::fmt::Debug {
    /// Insert the record unless an unexpired record already holds the
    /// session. An expired resident record counts as absent and is
    /// displaced. Returns whether the insert won.
    async fn insert_if_absent(&self, record: &LockRecord) -> Result<bool>;

    /// The session's record, filtered to unexpired.
    async fn get_active(&self, session_id: &str) -> Result<Option<LockRecord>>;

    /// The session's record regardless of expiry, so lazy cleanup can see
    /// what it is about to reap.
    async fn get_any(&self, session_id: &str) -> Result<Option<LockRecord>>;

    /// Delete the session's record if the predicate holds. Returns whether
    /// a record was deleted.
    async fn delete_if_matches(&self, session_id: &str, predicate: &LockPredicate) -> Result<bool>;

    /// Move `expires_at`/`last_activity_at` forward if the record is
    /// unexpired and the predicate holds. Returns the refreshed record.
    async fn update_expiry(
        &self,
        session_id: &str,
        new_expires_at: DateTime<Utc>,
        new_activity_at: DateTime<Utc>,
        predicate: &LockPredicate,
    ) -> Result<Option<LockRecord>>;

    async fn list_active_by_holder(&self, holder_id: &str) -> Result<Vec<LockRecord>>;

    async fn list_all_expired(&self) -> Result<Vec<LockRecord>>;
}

/// In-memory lock store. Conditional ops run under the DashMap entry lock
/// for their session, which is what makes them atomic.
#[derive(Debug)]
pub struct MemoryLockStore {
    records: DashMap<String, LockRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn insert_if_absent(&self, record: &LockRecord) -> Result<bool> {
        let now = self.clock.now();
        match self.records.entry(record.session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get_active(&self, session_id: &str) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(session_id)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.value().clone()))
    }

    async fn get_any(&self, session_id: &str) -> Result<Option<LockRecord>> {
        Ok(self
            .records
            .get(session_id)
            .map(|record| record.value().clone()))
    }

    async fn delete_if_matches(&self, session_id: &str, predicate: &LockPredicate) -> Result<bool> {
        match self.records.entry(session_id.to_string()) {
            Entry::Occupied(occupied) if predicate.matches(occupied.get()) => {
                occupied.remove();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_expiry(
        &self,
        session_id: &str,
        new_expires_at: DateTime<Utc>,
        new_activity_at: DateTime<Utc>,
        predicate: &LockPredicate,
    ) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        match self.records.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied)
                if !occupied.get().is_expired(now) && predicate.matches(occupied.get()) =>
            {
                let record = occupied.get_mut();
                record.expires_at = new_expires_at;
                record.last_activity_at = new_activity_at;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_active_by_holder(&self, holder_id: &str) -> Result<Vec<LockRecord>> {
        let now = self.clock.now();
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.holder_id == holder_id && !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_all_expired(&self) -> Result<Vec<LockRecord>> {
        let now = self.clock.now();
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// A session's protected payload plus its monotonic version counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub session_id: String,
    pub version: u64,
    pub payload: Value,
}

/// Result of a compare-and-swap: whether it was accepted, and the
/// resulting (post-write or still-current) version and payload.
#[derive(Debug, Clone)]
pub struct CasOutcome {
    pub accepted: bool,
    pub version: u64,
    pub payload: Value,
}

/// Persistence for versioned payloads, exposed only through an atomic
/// compare-and-swap. A write is accepted only when the caller's expected
/// version equals the stored version at write time.
#[async_trait]
pub trait VersionedRecordStore: Send + Sync + std::fmt::Debug {
    /// Current version and payload. An absent record reads as
    /// `(0, empty object)`.
    async fn get(&self, session_id: &str) -> Result<(u64, Value)>;

    /// Swap in `new_payload` if the stored version equals
    /// `expected_version`, incrementing the version by exactly one. A CAS
    /// against version 0 creates the record.
    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected_version: u64,
        new_payload: Value,
    ) -> Result<CasOutcome>;
}

#[derive(Debug, Default)]
pub struct MemoryVersionedStore {
    records: DashMap<String, VersionedRecord>,
}

impl MemoryVersionedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

#[async_trait]
impl VersionedRecordStore for MemoryVersionedStore {
    async fn get(&self, session_id: &str) -> Result<(u64, Value)> {
        Ok(self
            .records
            .get(session_id)
            .map_or_else(|| (0, empty_payload()), |r| (r.version, r.payload.clone())))
    }

    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected_version: u64,
        new_payload: Value,
    ) -> Result<CasOutcome> {
        match self.records.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version == expected_version {
                    let record = occupied.get_mut();
                    record.version += 1;
                    record.payload = new_payload;
                    Ok(CasOutcome {
                        accepted: true,
                        version: record.version,
                        payload: record.payload.clone(),
                    })
                } else {
                    Ok(CasOutcome {
                        accepted: false,
                        version: occupied.get().version,
                        payload: occupied.get().payload.clone(),
                    })
                }
            }
            Entry::Vacant(vacant) => {
                if expected_version == 0 {
                    let record = vacant.insert(VersionedRecord {
                        session_id: session_id.to_string(),
                        version: 1,
                        payload: new_payload,
                    });
                    Ok(CasOutcome {
                        accepted: true,
                        version: record.version,
                        payload: record.payload.clone(),
                    })
                } else {
                    Ok(CasOutcome {
                        accepted: false,
                        version: 0,
                        payload: empty_payload(),
                    })
                }
            }
        }
    }
}
