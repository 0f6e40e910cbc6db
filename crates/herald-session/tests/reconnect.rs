// SPDX-FileCopyrightText: 2026 Herald Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Disconnect handling and scheduled reconnects, on paused time.

use std::time::Duration;

use herald_core::{ConnectionState, SessionId, SessionState, StatusEvent};
use herald_session::{ExpiryReason, ReconnectOutcome};
use herald_test_utils::TestHarness;

fn id(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

#[tokio::test(start_paused = true)]
async fn permanent_reason_schedules_nothing() {
    let harness = TestHarness::builder().build();
    let engine = harness.create_connected("s1").await.unwrap();

    engine.disconnect("LOGOUT");
    harness
        .wait_for_state("s1", SessionState::Disconnected)
        .await
        .unwrap();
    harness.settle().await;

    let info = harness.registry.info("s1").await.unwrap();
    assert!(!info.reconnect_pending);
    assert!(!info.has_engine);
    assert_eq!(info.reconnection_attempts, 1);
    assert_eq!(info.last_disconnect_reason.as_deref(), Some("LOGOUT"));
    assert!(engine.is_destroyed());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.factory.created_count(), 1);
    assert_eq!(
        harness.registry.info("s1").await.unwrap().state,
        SessionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn transient_reason_reconnects_after_base_delay() {
    let harness = TestHarness::builder().build();
    let engine = harness.create_connected("s1").await.unwrap();

    engine.disconnect("NAVIGATION");
    harness
        .wait_for_state("s1", SessionState::Disconnected)
        .await
        .unwrap();
    harness.settle().await;
    let info = harness.registry.info("s1").await.unwrap();
    assert!(info.reconnect_pending);
    assert_eq!(info.reconnection_attempts, 1);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(engine.state_queries(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.state_queries(), 1);
    let info = harness
        .wait_for_state("s1", SessionState::Connected)
        .await
        .unwrap();
    assert_eq!(info.reconnection_attempts, 0);
    assert!(!info.reconnect_pending);
    // Resumed on the same engine.
    assert_eq!(harness.factory.created_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_conflict_recreates_the_engine() {
    let harness = TestHarness::builder().build();
    let first = harness.create_connected("s1").await.unwrap();
    first.set_state(ConnectionState::Conflict);

    first.disconnect("CONFLICT");
    harness.settle().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(first.is_destroyed());
    let second = harness.factory.wait_for_engines("s1", 2).await;
    assert_eq!(second.initialize_calls(), 1);
    assert_eq!(
        harness.registry.info("s1").await.unwrap().state,
        SessionState::Reconnecting
    );

    // Events from the replaced engine are ignored.
    assert!(!first.connect());
    second.connect();
    harness
        .wait_for_state("s1", SessionState::Connected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn unpaired_engine_surfaces_qr_expired_without_destroying() {
    let harness = TestHarness::builder().build();
    let engine = harness.create_connected("s1").await.unwrap();
    let mut sub = harness.registry.fanout().subscribe_session(&id("s1"));
    engine.set_state(ConnectionState::Unpaired);

    engine.disconnect("SYNC_LOST");
    harness.settle().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let mut saw_expired = false;
    while let Ok(Some(update)) =
        tokio::time::timeout(Duration::from_millis(10), sub.recv()).await
    {
        saw_expired |= update.event == StatusEvent::QrExpired;
    }
    assert!(saw_expired);
    assert!(!engine.is_destroyed());
    assert_eq!(engine.initialize_calls(), 2);
    assert_eq!(harness.factory.created_count(), 1);
    assert!(harness.registry.contains("s1"));

    engine.qr("fresh");
    harness
        .wait_for_state("s1", SessionState::AwaitingAuth)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_mark_the_session_failed() {
    let harness = TestHarness::builder().with_max_attempts(2).build();
    let engine = harness.create_connected("s1").await.unwrap();
    engine.set_state(ConnectionState::Conflict);
    harness.factory.fail_create("s1", "no browser");

    engine.disconnect("NAVIGATION");
    harness.settle().await;
    // Attempt 1 fails at 5s, attempt 2 is scheduled 10s later and fails too.
    tokio::time::sleep(Duration::from_secs(16)).await;

    let info = harness
        .wait_for_state("s1", SessionState::Failed)
        .await
        .unwrap();
    assert_eq!(info.reconnection_attempts, 3);
    assert!(!info.reconnect_pending);
    assert!(info.last_error.unwrap().contains("exhausted"));

    let stats = harness.registry.stats().await;
    assert_eq!(stats.problematic, 1);
    assert_eq!(stats.with_errors, 1);

    // Not auto-destroyed; the sweep picks it up.
    assert!(harness.registry.contains("s1"));
    let report = harness.registry.cleanup_expired(false).await;
    assert_eq!(report.expired.len(), 1);
    assert_eq!(report.expired[0].reason, ExpiryReason::AttemptsExhausted);
    assert!(!harness.registry.contains("s1"));
}

#[tokio::test(start_paused = true)]
async fn destroy_cancels_a_pending_reconnect() {
    let harness = TestHarness::builder().build();
    let engine = harness.create_connected("s1").await.unwrap();

    engine.disconnect("NAVIGATION");
    harness.settle().await;
    assert!(harness.registry.info("s1").await.unwrap().reconnect_pending);

    harness.registry.destroy("s1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.state_queries(), 0);
    assert_eq!(harness.factory.created_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect() {
    let harness = TestHarness::builder().build();
    let engine = harness.create_connected("s1").await.unwrap();
    assert_eq!(
        harness.registry.reconnect("s1").await.unwrap(),
        ReconnectOutcome::AlreadyConnected
    );

    engine.disconnect("LOGOUT");
    harness
        .wait_for_state("s1", SessionState::Disconnected)
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(
        harness.registry.reconnect("s1").await.unwrap(),
        ReconnectOutcome::Recreated
    );
    let fresh = harness.factory.latest("s1").unwrap();
    fresh.connect();
    let info = harness
        .wait_for_state("s1", SessionState::Connected)
        .await
        .unwrap();
    assert_eq!(info.reconnection_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_fails_without_retry() {
    let harness = TestHarness::builder().build();
    let engine = harness.create("s1").await.unwrap();

    engine.emit(herald_core::EngineEvent::AuthFailure("bad creds".into()));
    let info = harness
        .wait_for_state("s1", SessionState::Failed)
        .await
        .unwrap();
    assert_eq!(info.reconnection_attempts, 1);
    harness.settle().await;
    assert!(engine.is_destroyed());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.factory.created_count(), 1);
}
