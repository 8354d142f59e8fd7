//! Lock engine behavior under contention, expiry, and fencing.

use std::sync::Arc;
use std::time::Duration;

use taskweave::config::LockConfig;
use taskweave::lock::{LockEngine, LockMode, LockStatus};

mod common;

fn engine() -> Arc<LockEngine> {
    common::init_tracing();
    Arc::new(LockEngine::new(LockConfig::default()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_contention_has_single_winner() {
    let engine = engine();
    let mut handles = Vec::new();

    for i in 0..25 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .acquire(
                    "task-1",
                    &format!("agent-{}", i),
                    LockMode::Exclusive,
                    Some(Duration::from_secs(30)),
                )
                .await
        }));
    }

    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.success {
            winners.push(outcome);
        } else {
            losers.push(outcome);
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 24);

    let winner_id = winners[0].lock.as_ref().unwrap().agent_id.clone();
    for loser in &losers {
        assert_eq!(loser.status, LockStatus::Conflict);
        assert_eq!(loser.conflict.as_ref().unwrap().conflict_with, winner_id);
    }
    assert_eq!(
        engine.get_lock("task-1").unwrap().agent_id,
        winner_id
    );
}

#[tokio::test]
async fn test_collaborative_holders_coexist() {
    let engine = engine();

    for i in 0..5 {
        let outcome = engine
            .acquire(
                "task-1",
                &format!("agent-{}", i),
                LockMode::Collaborative,
                None,
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.lock.unwrap().version, i + 1);
    }

    let stats = engine.get_stats();
    assert_eq!(stats.collaborative_locks, 5);
    assert_eq!(stats.exclusive_locks, 0);
}

#[tokio::test]
async fn test_exclusive_denied_while_collaborative_held() {
    let engine = engine();
    engine
        .acquire("task-1", "agent-1", LockMode::Collaborative, None)
        .await;

    let outcome = engine
        .acquire("task-1", "agent-2", LockMode::Exclusive, None)
        .await;
    assert_eq!(outcome.status, LockStatus::Conflict);
    assert_eq!(outcome.conflict.unwrap().conflict_with, "agent-1");
}

#[tokio::test]
async fn test_lease_expiry_frees_the_task() {
    let engine = engine();
    engine
        .acquire(
            "task-1",
            "agent-1",
            LockMode::Exclusive,
            Some(Duration::from_millis(30)),
        )
        .await;
    assert!(engine.is_locked("task-1"));

    tokio::time::sleep(Duration::from_millis(60)).await;

    let outcome = engine
        .acquire("task-1", "agent-2", LockMode::Exclusive, None)
        .await;
    assert!(outcome.success);
    assert_eq!(engine.get_lock("task-1").unwrap().agent_id, "agent-2");
}

#[tokio::test]
async fn test_renewal_extends_without_version_bump() {
    let engine = engine();
    let acquired = engine
        .acquire(
            "task-1",
            "agent-1",
            LockMode::Exclusive,
            Some(Duration::from_secs(1)),
        )
        .await;
    let lock = acquired.lock.unwrap();

    let renewed = engine.renew("task-1", "agent-1", Duration::from_secs(60));
    assert_eq!(renewed.status, LockStatus::Renewed);
    let renewed_lock = renewed.lock.unwrap();
    assert_eq!(renewed_lock.version, lock.version);
    assert!(renewed_lock.expires_at > lock.expires_at);
}

#[tokio::test]
async fn test_fencing_sequence_across_handoffs() {
    let engine = engine();

    let a = engine
        .acquire("task-1", "agent-1", LockMode::Exclusive, None)
        .await;
    let v1 = a.lock.unwrap().version;
    assert_eq!(
        engine.release("task-1", "agent-1", v1).status,
        LockStatus::Released
    );

    let b = engine
        .acquire("task-1", "agent-2", LockMode::Exclusive, None)
        .await;
    let v2 = b.lock.unwrap().version;
    assert!(v2 > v1);
    assert_eq!(engine.current_version("task-1"), v2);

    // A stale token from the previous holder can no longer release.
    let stale = engine.release("task-1", "agent-2", v1);
    assert_eq!(stale.status, LockStatus::Conflict);
    assert!(engine.is_locked("task-1"));
}
