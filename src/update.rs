// Optimistic concurrency - version-guarded writes over the CAS contract

use crate::{error::Error, store::VersionedRecordStore, Result};
use serde_json::Value;
use std::sync::Arc;

/// How many times an auto-resolving update re-reads and re-merges after
/// losing a CAS race before giving up.
const MERGE_ATTEMPTS: usize = 3;

/// Outcome of a version-guarded write. Conflict is an expected result
/// carrying the live state so the caller can re-base and retry.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The caller's expected version matched and the patch was applied.
    Applied { new_version: u64, payload: Value },
    /// The expected version was stale; the patch was auto-merged onto the
    /// live payload and persisted.
    Merged { new_version: u64, payload: Value },
    /// The expected version was stale and auto-resolution was off. The
    /// store is untouched.
    Conflict {
        current_version: u64,
        current_payload: Value,
    },
}

impl UpdateOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn new_version(&self) -> Option<u64> {
        match self {
            Self::Applied { new_version, .. } | Self::Merged { new_version, .. } => {
                Some(*new_version)
            }
            Self::Conflict { .. } => None,
        }
    }
}

/// Lock-free, version-guarded read-modify-write over a
/// [`VersionedRecordStore`]. Detects concurrent writers instead of
/// preventing them; never consults the lock manager - combining "only the
/// lock holder may update" with version guards is the caller's
/// composition.
#[derive(Debug)]
pub struct OptimisticUpdateCoordinator {
    store: Arc<dyn VersionedRecordStore>,
}

impl OptimisticUpdateCoordinator {
    pub fn new(store: Arc<dyn VersionedRecordStore>) -> Self {
        Self { store }
    }

    /// Apply `patch` to the session's payload if `expected_version` is
    /// still current. On a stale version: report a conflict carrying the
    /// live state, or with `auto_resolve` merge the patch onto the live
    /// payload field-by-field and persist that.
    pub async fn update_with_version(
        &self,
        session_id: &str,
        expected_version: u64,
        patch: Value,
        auto_resolve: bool,
    ) -> Result<UpdateOutcome> {
        if session_id.trim().is_empty() {
            return Err(Error::InvalidInput {
                field: "session_id",
                reason: "must not be empty".to_string(),
            });
        }

        let (mut observed_version, mut observed_payload) = self.store.get(session_id).await?;

        if observed_version != expected_version && !auto_resolve {
            return Ok(UpdateOutcome::Conflict {
                current_version: observed_version,
                current_payload: observed_payload,
            });
        }

        for _ in 0..MERGE_ATTEMPTS {
            let next = auto_merge(&observed_payload, &patch);
            let cas = self
                .store
                .compare_and_swap(session_id, observed_version, next)
                .await?;

            if cas.accepted {
                return Ok(if observed_version == expected_version {
                    UpdateOutcome::Applied {
                        new_version: cas.version,
                        payload: cas.payload,
                    }
                } else {
                    UpdateOutcome::Merged {
                        new_version: cas.version,
                        payload: cas.payload,
                    }
                });
            }

            // Lost a race between read and swap
            if !auto_resolve {
                return Ok(UpdateOutcome::Conflict {
                    current_version: cas.version,
                    current_payload: cas.payload,
                });
            }
            observed_version = cas.version;
            observed_payload = cas.payload;
        }

        Err(Error::Contention {
            session_id: session_id.to_string(),
        })
    }
}

/// Field-level merge of a patch onto the current payload. Keys present in
/// both where both values are objects merge recursively; any other value
/// is taken from the patch - last writer wins per leaf. Best-effort: a
/// concurrent edit to the exact same leaf is overwritten, not reconciled.
pub fn auto_merge(current: &Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => auto_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let merged = auto_merge(&json!({"a": 1, "b": 2}), &json!({"b": 3}));
        assert_eq!(merged, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_merge_recurses_into_nested_objects() {
        let current = json!({"form": {"name": "x", "age": 1}, "done": false});
        let patch = json!({"form": {"age": 2}});
        let merged = auto_merge(&current, &patch);
        assert_eq!(merged, json!({"form": {"name": "x", "age": 2}, "done": false}));
    }

    #[test]
    fn test_patch_leaf_wins_over_mismatched_shapes() {
        // Object replaced by scalar and vice versa: the patch side wins
        assert_eq!(auto_merge(&json!({"a": {"b": 1}}), &json!({"a": 5})), json!({"a": 5}));
        assert_eq!(
            auto_merge(&json!({"a": 5}), &json!({"a": {"b": 1}})),
            json!({"a": {"b": 1}})
        );
    }

    #[test]
    fn test_merge_adds_new_keys() {
        let merged = auto_merge(&json!({}), &json!({"fresh": [1, 2, 3]}));
        assert_eq!(merged, json!({"fresh": [1, 2, 3]}));
    }

    #[test]
    fn test_merge_idempotent_when_leaves_agree() {
        let value = json!({"a": 1, "nested": {"b": "x"}});
        assert_eq!(auto_merge(&value, &value), value);
    }
}
