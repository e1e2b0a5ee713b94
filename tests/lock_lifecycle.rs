use chrono::Duration;
use latch::{
    store::LockStore, test_utils::TestHarness, AcquireOutcome, Clock, LockAction, LockConfig,
    LockEventKind, LockKind,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio_test::assert_ok;
use uuid::Uuid;

async fn grant(harness: &TestHarness, session: &str, holder: &str) -> latch::LockRecord {
    let outcome = harness
        .manager
        .acquire(session, holder, LockKind::Exclusive, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();
    outcome.record().expect("expected grant").clone()
}

#[tokio::test]
async fn test_acquire_then_conflict_reports_holder() {
    // Scenario: alice holds the session, bob is refused without force
    let harness = TestHarness::new();
    let record = grant(&harness, "s1", "alice").await;
    assert_eq!(record.holder_id, "alice");

    let outcome = harness
        .manager
        .acquire("s1", "bob", LockKind::Exclusive, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();

    let conflict = outcome.conflict().expect("expected conflict");
    assert_eq!(conflict.holder_id, "alice");
    assert!(conflict.message.contains("alice"));

    // Refusal mutated nothing
    let check = harness.manager.check("s1", Some("alice")).await.unwrap();
    assert!(check.owns_lock);
    assert_eq!(check.record.as_ref().unwrap().lease_token, record.lease_token);

    assert_eq!(harness.history.count("s1", LockAction::Conflict), 1);
}

#[tokio::test]
async fn test_forced_takeover() {
    // Scenario: bob forces alice off, alice no longer owns the lock
    let harness = TestHarness::new();
    let mut alice_rx = harness.notifier.subscribe_holder("alice");
    grant(&harness, "s1", "alice").await;

    let outcome = harness
        .manager
        .acquire("s1", "bob", LockKind::Exclusive, Some(Duration::seconds(300)), true, None)
        .await
        .unwrap();
    assert!(outcome.is_granted());

    let check = harness.manager.check("s1", Some("alice")).await.unwrap();
    assert!(!check.owns_lock);
    assert!(check.is_locked());
    assert_eq!(check.record.unwrap().holder_id, "bob");

    // Exactly one ForcedRelease entry and exactly one direct notification
    assert_eq!(harness.history.count("s1", LockAction::ForcedRelease), 1);
    let event = alice_rx.recv().await.unwrap();
    assert_eq!(event.kind, LockEventKind::LockForced);
    assert_eq!(event.actor, "bob");
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_expired_lock_is_cleaned_on_check() {
    // Scenario: a 1-second lease, checked after 2 seconds, reads as free
    let harness = TestHarness::new();
    harness
        .manager
        .acquire("s1", "alice", LockKind::Exclusive, Some(Duration::seconds(1)), false, None)
        .await
        .unwrap();

    harness.clock.advance(Duration::seconds(2));

    let check = harness.manager.check("s1", None).await.unwrap();
    assert!(!check.is_locked());
    assert!(check.owns_lock);
    assert_eq!(harness.history.count("s1", LockAction::Expired), 1);
    assert!(harness.store.is_empty());

    // A second check observes "already gone" and appends nothing
    let check = harness.manager.check("s1", None).await.unwrap();
    assert!(!check.is_locked());
    assert_eq!(harness.history.count("s1", LockAction::Expired), 1);
}

#[tokio::test]
async fn test_check_and_sweep_race_cleans_exactly_once() {
    let harness = Arc::new(TestHarness::new());
    harness
        .manager
        .acquire("s1", "alice", LockKind::Exclusive, Some(Duration::seconds(1)), false, None)
        .await
        .unwrap();
    harness.clock.advance(Duration::seconds(5));

    let (check, swept) = tokio::join!(
        harness.manager.check("s1", None),
        harness.manager.sweep_expired()
    );
    assert!(!check.unwrap().is_locked());
    assert!(swept.unwrap() <= 1);

    assert_eq!(harness.history.count("s1", LockAction::Expired), 1);
}

#[tokio::test]
async fn test_release_requires_matching_holder_and_token() {
    let harness = TestHarness::new();
    let record = grant(&harness, "s1", "alice").await;

    assert!(!harness.manager.release("s1", "bob", None).await.unwrap());
    assert!(!harness
        .manager
        .release("s1", "alice", Some(Uuid::new_v4()))
        .await
        .unwrap());
    assert!(harness
        .manager
        .release("s1", "alice", Some(record.lease_token))
        .await
        .unwrap());

    // Releasing an absent lock is a no-op success
    assert!(harness.manager.release("s1", "alice", None).await.unwrap());
    assert_eq!(harness.history.count("s1", LockAction::Released), 1);
}

#[tokio::test]
async fn test_release_makes_session_acquirable_by_another_holder() {
    let harness = TestHarness::new();
    let mut session_rx = harness.notifier.subscribe_session("s1");

    grant(&harness, "s1", "alice").await;
    assert!(assert_ok!(harness.manager.release("s1", "alice", None).await));

    let outcome = harness
        .manager
        .acquire("s1", "bob", LockKind::Exclusive, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();
    assert!(outcome.is_granted());

    assert_eq!(session_rx.recv().await.unwrap().kind, LockEventKind::LockAcquired);
    assert_eq!(session_rx.recv().await.unwrap().kind, LockEventKind::LockReleased);
    assert_eq!(session_rx.recv().await.unwrap().kind, LockEventKind::LockAcquired);
}

#[tokio::test]
async fn test_same_holder_acquire_renews_keeping_token() {
    let harness = TestHarness::new();
    let first = grant(&harness, "s1", "alice").await;

    harness.clock.advance(Duration::seconds(60));
    let outcome = harness
        .manager
        .acquire("s1", "alice", LockKind::Exclusive, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();
    let renewed = outcome.record().unwrap();

    assert_eq!(renewed.lease_token, first.lease_token);
    assert!(renewed.expires_at > first.expires_at);
    // Renewal is silent by default
    assert_eq!(harness.history.count("s1", LockAction::Acquired), 1);
}

#[tokio::test]
async fn test_renewal_audit_policy() {
    let config = LockConfig {
        audit_renewals: true,
        ..LockConfig::default()
    };
    let harness = TestHarness::with_config(config);

    grant(&harness, "s1", "alice").await;
    grant(&harness, "s1", "alice").await;

    assert_eq!(harness.history.count("s1", LockAction::Acquired), 2);
    let entries = harness.history.for_session("s1");
    assert_eq!(entries[1].metadata, Some(json!({ "renewal": true })));
}

#[tokio::test]
async fn test_extend_never_shortens_and_requires_token() {
    let harness = TestHarness::new();
    let record = grant(&harness, "s1", "alice").await;

    // A tiny extension clamps to the minimum and must not pull expiry back
    let extended = harness
        .manager
        .extend("s1", "alice", record.lease_token, Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(extended.expires_at, record.expires_at);

    let extended = harness
        .manager
        .extend("s1", "alice", record.lease_token, Duration::minutes(10))
        .await
        .unwrap()
        .unwrap();
    assert!(extended.expires_at > record.expires_at);

    // Never past the maximum window from now
    let capped = harness
        .manager
        .extend("s1", "alice", record.lease_token, Duration::hours(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(capped.expires_at, harness.clock.now() + Duration::minutes(30));

    assert!(harness
        .manager
        .extend("s1", "alice", Uuid::new_v4(), Duration::minutes(10))
        .await
        .unwrap()
        .is_none());
    assert!(harness
        .manager
        .extend("s1", "bob", record.lease_token, Duration::minutes(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_list_by_holder_excludes_expired() {
    let harness = TestHarness::new();
    grant(&harness, "s1", "alice").await;
    grant(&harness, "s2", "bob").await;
    harness
        .manager
        .acquire("s3", "alice", LockKind::Shared, Some(Duration::seconds(1)), false, None)
        .await
        .unwrap();

    harness.clock.advance(Duration::seconds(2));

    let locks = harness.manager.list_by_holder("alice").await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].session_id, "s1");
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let harness = TestHarness::new();
    for session in ["s1", "s2", "s3"] {
        harness
            .manager
            .acquire(session, "alice", LockKind::Exclusive, Some(Duration::seconds(1)), false, None)
            .await
            .unwrap();
    }
    grant(&harness, "s4", "bob").await;

    harness.clock.advance(Duration::seconds(2));

    assert_eq!(harness.manager.sweep_expired().await.unwrap(), 3);
    assert_eq!(harness.manager.sweep_expired().await.unwrap(), 0);
    assert!(harness.manager.check("s4", Some("bob")).await.unwrap().owns_lock);
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_winner() {
    let harness = Arc::new(TestHarness::new());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = Vec::new();
    for i in 0..8 {
        let harness = harness.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            let holder = format!("editor_{i}");
            barrier.wait().await;
            harness
                .manager
                .acquire("s1", &holder, LockKind::Exclusive, Some(Duration::seconds(300)), false, None)
                .await
                .unwrap()
        }));
    }

    let mut granted = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            AcquireOutcome::Granted(_) => granted += 1,
            AcquireOutcome::Conflict(_) => conflicts += 1,
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(harness.history.count("s1", LockAction::Acquired), 1);
}

#[tokio::test]
async fn test_shared_kind_still_blocks_other_holders() {
    // Shared is recorded for audit but does not co-hold
    let harness = TestHarness::new();
    harness
        .manager
        .acquire("s1", "alice", LockKind::Shared, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();

    let outcome = harness
        .manager
        .acquire("s1", "bob", LockKind::Shared, Some(Duration::seconds(300)), false, None)
        .await
        .unwrap();
    assert!(outcome.conflict().is_some());
}

#[tokio::test]
async fn test_heartbeat_keeps_lease_alive() {
    let config = LockConfig {
        heartbeat_interval: std::time::Duration::from_millis(25),
        ..LockConfig::default()
    };
    let harness = TestHarness::with_config(config);

    harness
        .manager
        .acquire("s1", "alice", LockKind::Exclusive, Some(Duration::seconds(2)), false, None)
        .await
        .unwrap();

    // Walk time forward in sub-lease steps, giving the renewal loop real
    // time to tick in between; without it the lease would be long dead
    for _ in 0..4 {
        harness.clock.advance(Duration::seconds(1));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    let check = harness.manager.check("s1", Some("alice")).await.unwrap();
    assert!(check.owns_lock && check.is_locked());

    harness.manager.release("s1", "alice", None).await.unwrap();
    assert_eq!(harness.manager.heartbeats().active_count(), 0);
}

#[tokio::test]
async fn test_release_and_force_stop_heartbeats() {
    let harness = TestHarness::new();
    grant(&harness, "s1", "alice").await;
    assert_eq!(harness.manager.heartbeats().active_count(), 1);

    // Forced takeover replaces alice's loop with bob's
    harness
        .manager
        .acquire("s1", "bob", LockKind::Exclusive, Some(Duration::seconds(300)), true, None)
        .await
        .unwrap();
    assert_eq!(harness.manager.heartbeats().active_count(), 1);

    harness.manager.release("s1", "bob", None).await.unwrap();
    assert_eq!(harness.manager.heartbeats().active_count(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_tasks_but_keeps_records() {
    let harness = TestHarness::new();
    grant(&harness, "s1", "alice").await;
    grant(&harness, "s2", "bob").await;

    harness.manager.shutdown();

    assert_eq!(harness.manager.heartbeats().active_count(), 0);
    assert!(harness.store.get_any("s1").await.unwrap().is_some());
    assert!(harness.store.get_any("s2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_client_metadata_round_trips() {
    let harness = TestHarness::new();
    let outcome = harness
        .manager
        .acquire(
            "s1",
            "alice",
            LockKind::Exclusive,
            Some(Duration::seconds(300)),
            false,
            Some(json!({ "device": "tablet", "step": 4 })),
        )
        .await
        .unwrap();

    let stored = harness.store.get_active("s1").await.unwrap().unwrap();
    assert_eq!(stored.client_metadata, Some(json!({ "device": "tablet", "step": 4 })));
    assert_eq!(stored.lease_token, outcome.record().unwrap().lease_token);
}
