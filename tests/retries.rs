// Classification-driven retries, terminal handling, reset and cancellation.

use crate::common::*;
use std::time::Duration;
use wa_connect::engine::whatsapp::{default_profiles, StatusKind};
use wa_connect::{ConnectionManager, ConnectionStatus, ErrorCategory, RemediationDecision};

/// Wait until the manager's live attempt is the transport's `index`-th session.
async fn attempt_live(manager: &ConnectionManager, transport: &ScriptedTransport, index: usize) -> bool {
    eventually(|| {
        transport.open_count() > index
            && manager.working_area_path("bot").is_some_and(|p| p == transport.session(index).dir())
    })
    .await
}

#[tokio::test]
async fn logged_out_is_terminal_until_reset() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();
    let mut events = manager.subscribe();

    manager.init_connection("bot").await;
    let attempt = transport.last();
    attempt.close(Some(401), "Connection Failure");

    assert!(eventually(|| manager.snapshot("bot").is_some_and(|s| s.status == ConnectionStatus::Terminal)).await);
    assert!(attempt.session.is_ended());
    assert!(!attempt.dir().exists());
    let err = manager.get_last_error("bot").unwrap();
    assert_eq!(err.category, ErrorCategory::TransportDisconnect(RemediationDecision::GiveUp));
    assert_eq!(err.code, "401");

    settle().await;
    assert_eq!(transport.open_count(), 1);
    assert!(!manager.snapshot("bot").unwrap().retry_scheduled);

    let mut kinds = Vec::new();
    while let Ok(ev) = events.try_recv() {
        kinds.push(ev.kind);
    }
    assert_eq!(kinds.last(), Some(&StatusKind::Terminal));

    // Terminal needs an explicit reset.
    assert!(!manager.init_connection("bot").await);
    assert_eq!(transport.open_count(), 1);

    assert!(manager.reset_connection("bot").await);
    assert!(attempt_live(&manager, &transport, 1).await);
    let snap = manager.snapshot("bot").unwrap();
    assert_eq!(snap.status, ConnectionStatus::Initializing);
    assert_eq!(snap.retry_count, 0);
    assert!(snap.last_error.is_none());
}

#[tokio::test]
async fn different_approach_rotates_profiles_until_ceiling() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let config = wa_connect::ConnectionConfig { max_retry_attempts: 2, ..fast_config(root.path()) };
    let manager = ConnectionManager::new(config, transport.clone(), seeded_store(&["bot"])).unwrap();
    let profiles = default_profiles();

    manager.init_connection("bot").await;
    let mut generations = vec![manager.snapshot("bot").unwrap().generation];

    for index in 1..=2 {
        transport.session(index - 1).close(Some(515), "Stream Errored (restart required)");
        assert!(attempt_live(&manager, &transport, index).await);
        let snap = manager.snapshot("bot").unwrap();
        assert_eq!(snap.retry_count, index as u32);
        assert_eq!(snap.profile, profiles[index]);
        assert_eq!(transport.session(index).profile, profiles[index]);
        generations.push(snap.generation);
    }

    assert!(generations.windows(2).all(|w| w[0] < w[1]));
    assert_ne!(transport.session(0).dir(), transport.session(1).dir());
    assert!(!transport.session(0).dir().exists());
    assert!(!transport.session(1).dir().exists());

    // Third close hits the ceiling.
    transport.session(2).close(Some(515), "Stream Errored (restart required)");
    assert!(eventually(|| manager.snapshot("bot").is_some_and(|s| s.status == ConnectionStatus::Terminal)).await);
    assert_eq!(
        manager.get_last_error("bot").unwrap().category,
        ErrorCategory::TransportDisconnect(RemediationDecision::GiveUp)
    );
    settle().await;
    assert_eq!(transport.open_count(), 3);
    assert_eq!(dir_entries(root.path()), 0);
}

#[tokio::test]
async fn simple_retry_keeps_profile() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    transport.last().close(Some(408), "Connection was lost");
    assert!(attempt_live(&manager, &transport, 1).await);

    assert_eq!(transport.session(1).profile, transport.session(0).profile);
    let snap = manager.snapshot("bot").unwrap();
    assert_eq!(snap.retry_count, 1);
    assert_eq!(
        snap.last_error.unwrap().category,
        ErrorCategory::TransportDisconnect(RemediationDecision::RetrySimple)
    );
}

#[tokio::test]
async fn successful_connect_resets_retry_count() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    transport.last().close(Some(428), "Connection Closed");
    assert!(attempt_live(&manager, &transport, 1).await);
    transport.session(1).complete_pairing();

    assert!(eventually(|| manager.is_connected("bot")).await);
    assert_eq!(manager.snapshot("bot").unwrap().retry_count, 0);
}

#[tokio::test]
async fn stream_end_without_close_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    let attempt = transport.last();
    attempt.hang_up();

    assert!(attempt_live(&manager, &transport, 1).await);
    assert!(attempt.session.is_ended());
    let err = manager.get_last_error("bot").unwrap();
    assert_eq!(err.code, "unknown");
    assert_eq!(err.category, ErrorCategory::TransportDisconnect(RemediationDecision::RetrySimple));
}

fn slow_retry_config(root: &std::path::Path) -> wa_connect::ConnectionConfig {
    wa_connect::ConnectionConfig {
        simple_backoff_base_ms: 300,
        simple_backoff_cap_ms: 300,
        ..fast_config(root)
    }
}

#[tokio::test]
async fn reset_cancels_pending_retry() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager =
        ConnectionManager::new(slow_retry_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    transport.last().close(Some(408), "Connection was lost");
    assert!(eventually(|| manager.snapshot("bot").is_some_and(|s| s.retry_scheduled)).await);

    assert!(manager.reset_connection("bot").await);
    assert!(attempt_live(&manager, &transport, 1).await);

    // The retry timer would have fired by now.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(manager.snapshot("bot").unwrap().retry_count, 0);
    assert!(!transport.session(1).session.is_ended());
}

#[tokio::test]
async fn reset_never_lowers_the_generation() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    let first = manager.snapshot("bot").unwrap().generation;
    assert!(first > 0);
    let mut events = manager.subscribe();

    assert!(manager.reset_connection("bot").await);
    let during = manager.snapshot("bot").unwrap();
    assert!(during.generation >= first);
    assert_eq!(during.retry_count, 0);
    let ev = events.try_recv().unwrap();
    assert_eq!(ev.kind, StatusKind::Starting);
    assert_eq!(ev.generation, first);

    assert!(attempt_live(&manager, &transport, 1).await);
    assert!(manager.snapshot("bot").unwrap().generation > first);
}

#[tokio::test]
async fn close_cancels_pending_retry() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager =
        ConnectionManager::new(slow_retry_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    transport.last().close(Some(503), "Service Unavailable");
    assert!(eventually(|| manager.snapshot("bot").is_some_and(|s| s.retry_scheduled)).await);

    assert!(manager.close_connection("bot").await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.open_count(), 1);
    assert!(manager.snapshot("bot").is_none());
}

#[tokio::test]
async fn manual_setup_failure_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    transport.fail_next(1);
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    assert!(!manager.init_connection("bot").await);
    let snap = manager.snapshot("bot").unwrap();
    assert_eq!(snap.status, ConnectionStatus::Disconnected);
    assert!(!snap.retry_scheduled);
    assert_eq!(snap.last_error.unwrap().category, ErrorCategory::Setup);
    assert!(manager.list_active().is_empty());
    assert_eq!(dir_entries(root.path()), 0);

    assert!(manager.init_connection("bot").await);
    assert_eq!(manager.snapshot("bot").unwrap().status, ConnectionStatus::Initializing);
}

#[tokio::test]
async fn setup_failure_during_retry_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), seeded_store(&["bot"])).unwrap();

    manager.init_connection("bot").await;
    transport.fail_next(1);
    transport.last().close(Some(408), "Connection was lost");

    assert!(attempt_live(&manager, &transport, 1).await);
    let snap = manager.snapshot("bot").unwrap();
    assert_eq!(snap.status, ConnectionStatus::Initializing);
    assert_eq!(snap.retry_count, 2);
    assert_eq!(dir_entries(root.path()), 1);
}
