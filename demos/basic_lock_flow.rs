use chrono::Duration;
use latch::{
    clock::SystemClock,
    history::MemoryHistoryRecorder,
    notify::ChannelNotifier,
    store::{MemoryLockStore, MemoryVersionedStore},
    LockConfig, LockKind, OptimisticUpdateCoordinator, SessionLockManager, UpdateOutcome,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("latch - session lock & optimistic concurrency demo");
    println!("==================================================\n");

    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryLockStore::new(clock.clone()));
    let history = Arc::new(MemoryHistoryRecorder::new());
    let notifier = Arc::new(ChannelNotifier::new());
    let manager = SessionLockManager::new(
        store,
        clock,
        history.clone(),
        notifier.clone(),
        LockConfig::default(),
    );

    let mut alice_inbox = notifier.subscribe_holder("alice");
    let session = "intake-form-7781";

    // 1. Alice opens the session for editing
    let outcome = manager
        .acquire(session, "alice", LockKind::Exclusive, Some(Duration::minutes(5)), false, None)
        .await?;
    let alice_lock = outcome.record().expect("free session").clone();
    println!("✅ alice acquired the session (token {})", alice_lock.lease_token);

    // 2. Bob tries to edit and is told who holds it
    let outcome = manager
        .acquire(session, "bob", LockKind::Exclusive, None, false, None)
        .await?;
    let conflict = outcome.conflict().expect("alice holds it");
    println!("⛔ bob refused: {}", conflict.message);

    // 3. A supervisor forces access; alice gets told directly
    let outcome = manager
        .acquire(session, "supervisor", LockKind::Exclusive, None, true, None)
        .await?;
    let supervisor_lock = outcome.record().expect("forced grant").clone();
    let notice = alice_inbox.recv().await?;
    println!("⚠️  forced takeover; alice was notified: {:?}", notice.message);

    // 4. The supervisor finishes and releases
    let released = manager
        .release(session, "supervisor", Some(supervisor_lock.lease_token))
        .await?;
    println!("🔓 supervisor released: {released}\n");

    manager.shutdown();

    // Lock-free path: version-guarded writes to the record payload
    let records = Arc::new(MemoryVersionedStore::new());
    let coordinator = OptimisticUpdateCoordinator::new(records);

    let outcome = coordinator
        .update_with_version(session, 0, json!({"applicant": {"name": "A. Lovelace"}}), false)
        .await?;
    println!("✍️  first write -> version {:?}", outcome.new_version());

    // A stale writer conflicts...
    let outcome = coordinator
        .update_with_version(session, 0, json!({"status": "review"}), false)
        .await?;
    if let UpdateOutcome::Conflict { current_version, .. } = &outcome {
        println!("⛔ stale write conflicted; live version is {current_version}");
    }

    // ...or merges field-by-field when asked to
    let outcome = coordinator
        .update_with_version(session, 0, json!({"status": "review"}), true)
        .await?;
    if let UpdateOutcome::Merged { new_version, payload } = &outcome {
        println!("🔀 auto-merged -> version {new_version}: {payload}");
    }

    println!("\naudit trail:");
    for entry in history.snapshot() {
        println!("  {:?} {} by {}", entry.action, entry.session_id, entry.actor_id);
    }

    Ok(())
}
