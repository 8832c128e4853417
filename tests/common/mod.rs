// Shared test doubles: a transport whose sessions are driven by the test,
// and a bot store that refuses writes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wa_connect::engine::whatsapp::{
    AuthState, ConnectionConfig, Transport, TransportEvent, TransportHandle, TransportSession,
};
use wa_connect::{
    BotStore, ClientProfile, DisconnectCause, EngineError, EngineResult, PairedSession,
    ProtocolVersion, SessionStore,
};

// ── Fake session ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSession {
    ended: AtomicBool,
    pending: Mutex<Option<String>>,
}

impl FakeSession {
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn pending_pairing_payload(&self) -> Option<String> {
        self.pending.lock().clone()
    }

    async fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

// ── Scripted transport ─────────────────────────────────────────────────

pub struct Opened {
    pub profile: ClientProfile,
    pub auth: Arc<AuthState>,
    pub session: Arc<FakeSession>,
    sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl Opened {
    pub fn dir(&self) -> PathBuf {
        self.auth.dir().to_path_buf()
    }

    /// Push an event; silently dropped once the manager stopped listening.
    pub fn send(&self, event: TransportEvent) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn close(&self, status: Option<u16>, message: &str) {
        self.send(TransportEvent::Closed(DisconnectCause::new(status, message)));
    }

    /// Drop the sending half without a close event.
    pub fn hang_up(&self) {
        self.sender.lock().take();
    }

    /// Creds update + open, the way a successful scan ends.
    pub fn complete_pairing(&self) {
        self.send(TransportEvent::CredentialsUpdated(serde_json::json!({
            "me": { "id": "15550001:7@s.whatsapp.net", "name": "bot" },
            "registered": true,
        })));
        self.send(TransportEvent::Opened);
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    opened: Mutex<Vec<Arc<Opened>>>,
    failures: AtomicUsize,
    preloaded: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` opens fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Next session holds this payload without emitting it.
    pub fn preload_payload(&self, payload: &str) {
        *self.preloaded.lock() = Some(payload.to_string());
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<Opened> {
        self.opened.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<Opened> {
        let opened = self.opened.lock();
        opened[opened.len() - 1].clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        auth: Arc<AuthState>,
        profile: &ClientProfile,
        _version: ProtocolVersion,
    ) -> EngineResult<TransportHandle> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Transport("socket refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession::default());
        *session.pending.lock() = self.preloaded.lock().take();
        self.opened.lock().push(Arc::new(Opened {
            profile: profile.clone(),
            auth,
            session: session.clone(),
            sender: Mutex::new(Some(tx)),
        }));
        Ok(TransportHandle { session, events: rx })
    }
}

// ── Stores ─────────────────────────────────────────────────────────────

/// Resolves subscriptions but every write fails.
pub struct ReadOnlyStore;

#[async_trait]
impl BotStore for ReadOnlyStore {
    async fn subscription_for_bot(&self, _bot_id: &str) -> EngineResult<Option<String>> {
        Ok(Some("sub".into()))
    }

    async fn plan_duration_days(&self, _subscription_id: &str) -> EngineResult<i64> {
        Ok(30)
    }

    async fn write_paired_session(&self, _bot_id: &str, _session: &PairedSession) -> EngineResult<()> {
        Err(EngineError::Other("database is locked".into()))
    }
}

/// In-memory store with a 30-day plan and `bots` attached to it.
pub fn seeded_store(bots: &[&str]) -> Arc<SessionStore> {
    let store = SessionStore::open_in_memory().unwrap();
    store.create_plan("monthly", "Monthly", 30).unwrap();
    store.create_subscription("sub-1", "monthly", "alice").unwrap();
    for bot in bots {
        store.create_bot(bot, Some("sub-1")).unwrap();
    }
    Arc::new(store)
}

// ── Config / helpers ───────────────────────────────────────────────────

/// Millisecond-scale timings so the tests run in real time.
pub fn fast_config(root: &Path) -> ConnectionConfig {
    ConnectionConfig {
        sessions_root: root.to_path_buf(),
        simple_backoff_base_ms: 10,
        simple_backoff_cap_ms: 40,
        different_approach_backoff_base_ms: 15,
        different_approach_backoff_cap_ms: 60,
        reset_delay_ms: 20,
        qr_poll_window_secs: 5,
        qr_poll_interval_ms: 20,
        qr_min_dimension: 200,
        ..ConnectionConfig::default()
    }
}

/// Poll `check` until it holds or ~5s pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

pub fn dir_entries(root: &Path) -> usize {
    std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
}
