//! Per-user serialization tests
//!
//! Work for one user is serialized; work for different users is not.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use conversa::config::SessionConfig;
use conversa::state::{Role, SessionStore};
use helpers::*;

#[tokio::test]
async fn test_held_lease_does_not_block_other_users() {
    init_test_logging();
    let store = SessionStore::new(SessionConfig::default(), None);

    let _held = store.acquire("u1").await;

    let other = timeout(Duration::from_secs(1), store.append_history("u2", Role::User, "hola")).await;
    assert!(other.is_ok(), "u2 was blocked by a lease on u1");

    let same = timeout(Duration::from_millis(50), store.append_history("u1", Role::User, "hola")).await;
    assert!(same.is_err(), "u1 should wait for the held lease");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_are_not_lost() {
    init_test_logging();
    let mut config = SessionConfig::default();
    config.history_limit = 500;
    let store = Arc::new(SessionStore::new(config, None));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store.append_history("u1", Role::User, &format!("turn {i}")).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let session = store.peek("u1").await.unwrap();
    assert_eq!(session.history().len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_events_for_many_users() {
    let ctx = Arc::new(TestContext::new());

    let mut tasks = Vec::new();
    for user in 0..20 {
        for message in 0..5 {
            let ctx = Arc::clone(&ctx);
            tasks.push(tokio::spawn(async move {
                let event = text_event(&format!("u{user}"), &format!("m{user}-{message}"), "precio?");
                ctx.orchestrator.handle(&request(), &event).await.unwrap()
            }));
        }
    }

    let mut processed = 0;
    for task in tasks {
        if !task.await.unwrap().is_duplicate() {
            processed += 1;
        }
    }

    assert_eq!(processed, 100);
    assert_eq!(ctx.sessions.len(), 20);
    for user in 0..20 {
        let session = ctx.sessions.peek(&format!("u{user}")).await.unwrap();
        // each event adds the user turn and one reply
        assert_eq!(session.history().len(), 10);
    }
}

#[tokio::test]
async fn test_end_session_waits_for_queued_lease() {
    init_test_logging();
    let store = Arc::new(SessionStore::new(SessionConfig::default(), None));
    let first = store.acquire("u1").await;

    let (got_tx, got_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let queued = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut lease = store.acquire("u1").await;
            lease.append_history(Role::User, "queued");
            let _ = got_tx.send(());
            let _ = release_rx.await;
        })
    };
    tokio::task::yield_now().await;

    let ending = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.end_session("u1").await })
    };
    tokio::task::yield_now().await;

    drop(first);
    got_rx.await.unwrap();

    // the queued caller holds the only lease until it lets go
    let second = timeout(Duration::from_millis(100), store.acquire("u1")).await;
    assert!(second.is_err(), "a second lease was granted while one is held");

    release_tx.send(()).unwrap();
    queued.await.unwrap();
    assert!(ending.await.unwrap());
    assert!(!store.contains("u1"));

    let fresh = store.get("u1").await;
    assert!(fresh.history().is_empty());
}
