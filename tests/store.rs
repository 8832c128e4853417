// File-backed store: paired sessions written by the manager survive a reopen
// and are cleared by the expiration sweep.

use crate::common::*;
use std::sync::Arc;
use wa_connect::engine::whatsapp::{load_config, save_config, SessionEnvelope};
use wa_connect::{BotStatus, ConnectionConfig, ConnectionManager, SessionStore};

#[tokio::test]
async fn paired_session_survives_reopen_and_expires() {
    let root = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("nested").join("wa-connect.db");

    let store = Arc::new(SessionStore::open(&db_path).unwrap());
    store.create_plan("weekly", "Weekly", 7).unwrap();
    store.create_subscription("sub-w", "weekly", "carol").unwrap();
    store.create_bot("bot", Some("sub-w")).unwrap();

    let transport = ScriptedTransport::new();
    let manager = ConnectionManager::new(fast_config(root.path()), transport.clone(), store.clone()).unwrap();
    manager.init_connection("bot").await;
    transport.last().complete_pairing();
    assert!(eventually(|| manager.is_connected("bot")).await);
    manager.shutdown().await;
    drop(manager);
    drop(store);

    let reopened = SessionStore::open(&db_path).unwrap();
    let bot = reopened.get_bot("bot").unwrap().unwrap();
    assert_eq!(bot.status, BotStatus::Active);
    let envelope: SessionEnvelope = serde_json::from_str(bot.session_blob.as_deref().unwrap()).unwrap();
    assert_eq!(envelope.creds["registered"], serde_json::json!(true));
    let expires_at = bot.expires_at.unwrap();

    assert_eq!(reopened.expire_due(expires_at - chrono::Duration::seconds(1)).unwrap(), 0);
    assert_eq!(reopened.expire_due(expires_at).unwrap(), 1);
    let bot = reopened.get_bot("bot").unwrap().unwrap();
    assert_eq!(bot.status, BotStatus::Expired);
    assert!(bot.session_blob.is_none());
}

#[test]
fn stored_config_drives_the_manager() {
    let root = tempfile::tempdir().unwrap();
    let store = SessionStore::open_in_memory().unwrap();
    assert_eq!(load_config(&store).unwrap(), ConnectionConfig::default());

    let config = ConnectionConfig { max_retry_attempts: 9, ..fast_config(root.path()) };
    save_config(&store, &config).unwrap();
    let loaded = load_config(&store).unwrap();
    assert_eq!(loaded.max_retry_attempts, 9);
    assert_eq!(loaded.sessions_root, root.path());

    let bad = ConnectionConfig { profiles: Vec::new(), ..config };
    assert!(save_config(&store, &bad).is_err());
    assert!(ConnectionManager::new(bad, ScriptedTransport::new(), Arc::new(store)).is_err());
}
