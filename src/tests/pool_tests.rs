//! Session pool behavior: capacity accounting, configuration races,
//! retirement, and the shutdown drain barrier.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::GatewayError;
use crate::pool::{PoolOptions, SessionPool};
use crate::test_utils::{ScriptedConnector, ScriptedReply};
use crate::transaction::{Command, Product};

fn probe_command() -> Command {
    Command::Show {
        product: Product::VersionInfo,
        dataset: None,
    }
}

fn scripted_pool_with(
    capacity: usize,
    options: PoolOptions,
) -> (Arc<SessionPool>, Arc<ScriptedConnector>) {
    let connector = Arc::new(ScriptedConnector::new());
    let pool = Arc::new(SessionPool::new(options));
    assert!(pool.configure_with_connector(Box::new(Arc::clone(&connector)), capacity));
    (pool, connector)
}

fn scripted_pool(capacity: usize) -> (Arc<SessionPool>, Arc<ScriptedConnector>) {
    scripted_pool_with(capacity, PoolOptions::default())
}

#[tokio::test]
async fn checkout_before_configure_fails() {
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    let got = pool.checkout().await;
    assert!(matches!(got, Err(GatewayError::NotConfigured)));
}

#[tokio::test]
async fn configure_is_one_shot() {
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    assert!(pool.configure_with_connector(Box::new(ScriptedConnector::new()), 3));
    assert!(!pool.configure_with_connector(Box::new(ScriptedConnector::new()), 7));
    assert_eq!(pool.stats().capacity, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_configure_has_exactly_one_winner() {
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let mut attempts = Vec::new();
    for capacity in 1..=8usize {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        attempts.push(tokio::spawn(async move {
            barrier.wait().await;
            pool.configure_with_connector(Box::new(ScriptedConnector::new()), capacity)
                .then_some(capacity)
        }));
    }

    let winners: Vec<usize> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap())
        .collect();

    assert_eq!(winners.len(), 1, "exactly one configure call may win");
    assert_eq!(pool.stats().capacity, winners[0]);
}

#[tokio::test]
async fn capacity_bounds_concurrent_checkouts() {
    let (pool, connector) = scripted_pool(2);

    let first = pool.checkout().await.unwrap();
    let second = pool.checkout().await.unwrap();

    let denied = pool.checkout_within(Some(Duration::from_millis(50))).await;
    match denied {
        Err(GatewayError::CheckoutTimeout { capacity, .. }) => assert_eq!(capacity, 2),
        other => panic!("expected checkout timeout, got {:?}", other.map(|_| ())),
    }

    first.release().await;
    let third = pool
        .checkout_within(Some(Duration::from_millis(200)))
        .await;
    assert!(third.is_ok());

    second.release().await;
    third.unwrap().release().await;
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn construction_failure_releases_the_permit() {
    let (pool, connector) = scripted_pool(1);
    connector.fail_next_connects(1);

    let failed = pool.checkout().await;
    assert!(matches!(failed, Err(GatewayError::Transport(_))));

    // The capacity slot must be free again: a bounded wait succeeds.
    let recovered = pool
        .checkout_within(Some(Duration::from_millis(200)))
        .await
        .unwrap();
    recovered.release().await;
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn handshake_rejection_releases_the_permit() {
    let (pool, connector) = scripted_pool(1);
    connector.reject_handshakes(true);

    let rejected = pool.checkout().await;
    match rejected {
        Err(e) => assert!(e.is_backend_unreachable()),
        Ok(_) => panic!("handshake rejection must fail the checkout"),
    }

    connector.reject_handshakes(false);
    let recovered = pool
        .checkout_within(Some(Duration::from_millis(200)))
        .await;
    assert!(recovered.is_ok());
}

#[tokio::test]
async fn idle_sessions_are_reused_in_order() {
    let (pool, connector) = scripted_pool(1);

    let mut lease = pool.checkout().await.unwrap();
    assert!(lease.is_fresh());
    lease.execute_discarding(&probe_command()).await.unwrap();
    let first_id = lease.session_id();
    lease.release().await;
    assert_eq!(pool.stats().idle, 1);

    let lease = pool.checkout().await.unwrap();
    assert_eq!(lease.session_id(), first_id);
    assert!(!lease.is_fresh());
    lease.release().await;

    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn dead_sessions_are_destroyed_on_return() {
    let (pool, connector) = scripted_pool(1);

    let mut lease = pool.checkout().await.unwrap();
    lease.execute_discarding(&probe_command()).await.unwrap();
    lease.mark_dead();
    lease.release().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.destroyed_total, 1);
    assert!(connector.handles()[0].closed());

    // the replacement is a brand new session
    let lease = pool.checkout().await.unwrap();
    assert!(lease.is_fresh());
    lease.release().await;
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn sessions_retire_once_past_the_command_budget() {
    let options = PoolOptions {
        max_commands_per_session: 2,
        ..PoolOptions::default()
    };
    let (pool, connector) = scripted_pool_with(1, options);

    let mut lease = pool.checkout().await.unwrap();
    lease.execute_discarding(&probe_command()).await.unwrap();
    lease.execute_discarding(&probe_command()).await.unwrap();
    lease.release().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 0, "a retired session must not be requeued");
    assert_eq!(stats.retired_total, 1);
    assert_eq!(stats.destroyed_total, 1);
    // retirement closes the session gracefully
    let handle = &connector.handles()[0];
    assert!(handle.closed());
    assert!(handle.informed_on_close());

    let lease = pool.checkout().await.unwrap();
    assert!(lease.is_fresh());
    lease.release().await;
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn one_command_under_the_budget_still_requeues() {
    let options = PoolOptions {
        max_commands_per_session: 2,
        ..PoolOptions::default()
    };
    let (pool, _connector) = scripted_pool_with(1, options);

    let mut lease = pool.checkout().await.unwrap();
    lease.execute_discarding(&probe_command()).await.unwrap();
    lease.release().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.retired_total, 0);
}

#[tokio::test]
async fn dropped_lease_repairs_accounting_without_requeue() {
    let (pool, connector) = scripted_pool(1);

    let lease = pool.checkout().await.unwrap();
    drop(lease);
    // the discard close runs on a spawned task
    tokio::task::yield_now().await;

    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.idle, 0, "a dropped lease must never requeue its session");
    assert_eq!(stats.destroyed_total, 1);

    // capacity is back
    let recovered = pool
        .checkout_within(Some(Duration::from_millis(200)))
        .await;
    assert!(recovered.is_ok());
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test]
async fn shutdown_waits_for_outstanding_leases() {
    let (pool, connector) = scripted_pool(2);

    // one session idles, one stays out
    let mut parked = pool.checkout().await.unwrap();
    parked.execute_discarding(&probe_command()).await.unwrap();
    parked.release().await;
    let held = pool.checkout().await.unwrap();

    let drain_pool = Arc::clone(&pool);
    let drain = tokio::spawn(async move { drain_pool.shutdown().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pool.is_shutting_down());
    assert!(!drain.is_finished(), "drain must wait for the held lease");

    let denied = pool.checkout().await;
    assert!(matches!(denied, Err(GatewayError::ShuttingDown)));

    held.release().await;
    tokio::time::timeout(Duration::from_secs(1), drain)
        .await
        .expect("drain must complete once all leases are home")
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.checked_out, 0);
    // both sessions were closed gracefully
    for handle in connector.handles() {
        assert!(handle.closed());
    }

    let after = pool.checkout().await;
    assert!(matches!(after, Err(GatewayError::ShuttingDown)));
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (pool, _connector) = scripted_pool(1);
    pool.shutdown().await;
    // second call returns immediately instead of deadlocking on permits
    tokio::time::timeout(Duration::from_millis(100), pool.shutdown())
        .await
        .expect("repeat shutdown must be a no-op");
}

#[tokio::test]
async fn shutdown_before_configure_is_clean() {
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    pool.shutdown().await;
    assert!(pool.is_shutting_down());
}

#[tokio::test]
async fn stats_track_the_session_registry() {
    let (pool, _connector) = scripted_pool(2);
    assert!(pool.stats().configured);
    assert_eq!(pool.stats().endpoint.as_deref(), Some("scripted:0"));

    let lease = pool.checkout().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 1);
    assert_eq!(stats.created_total, 1);
    assert_eq!(stats.available_permits, 1);

    let sessions = pool.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, lease.session_id());
    assert_eq!(sessions[0].state, "checked-out");

    lease.release().await;
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn zero_capacity_request_is_clamped() {
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    assert!(pool.configure_with_connector(Box::new(ScriptedConnector::new()), 0));
    assert_eq!(pool.stats().capacity, 1);
}

#[tokio::test]
async fn scripted_disconnect_mid_checkout_counts_once() {
    // a session that dies on its first command is destroyed, not requeued
    let connector = Arc::new(ScriptedConnector::with_script(vec![
        ScriptedReply::Disconnect,
    ]));
    let pool = Arc::new(SessionPool::new(PoolOptions::default()));
    assert!(pool.configure_with_connector(Box::new(Arc::clone(&connector)), 1));

    let mut lease = pool.checkout().await.unwrap();
    let failed = lease.execute_discarding(&probe_command()).await;
    assert!(failed.is_err());
    lease.mark_dead();
    lease.release().await;

    assert_eq!(pool.stats().destroyed_total, 1);
    assert_eq!(pool.stats().idle, 0);
}
