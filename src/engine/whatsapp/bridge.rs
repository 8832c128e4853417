// WhatsApp Connection Manager — Connection Registry / Supervisor
// ConnectionManager: init, close, reset, status queries, event pump, retry
// scheduling, QR fallback poll
//
// Concurrency model:
//   • `entries` (parking_lot) is the only state shared across bots. It is held
//     for short, non-async critical sections only.
//   • Every control operation and every event handler for one bot runs under
//     that bot's async op lock, so work for a single bot is serialized while
//     different bots never wait on each other.
//   • Each attempt gets a generation from a process-wide monotonic counter.
//     Handlers, timers, and the QR poll re-check that their generation is
//     still the live one after taking the op lock and drop out if not.

use super::auth_state::AuthState;
use super::classifier;
use super::config::ConnectionConfig;
use super::events::{StatusEvent, StatusKind};
use super::machine::{ConnectionMachine, Input, Outcome};
use super::persistence::PersistenceWriter;
use super::qr;
use super::retry::{RetryPlan, RetryPolicy};
use super::transport::{Transport, TransportEvent, TransportHandle, TransportSession};
use super::working_area::{self, WorkingArea};
use crate::atoms::constants::STATUS_EVENT_CAPACITY;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::BotStore;
use crate::atoms::types::{
    ClientProfile, ConnectionSnapshot, ConnectionStatus, DisconnectCause, ErrorCategory,
    ErrorRecord, RemediationDecision, StatusView,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

// ── Per-bot bookkeeping ────────────────────────────────────────────────

/// Resources of the one live attempt for a bot.
struct LiveAttempt {
    generation: u64,
    session: Arc<dyn TransportSession>,
    auth: Arc<AuthState>,
    /// Taken and removed once the paired session is persisted.
    area: Option<WorkingArea>,
    pump: Option<JoinHandle<()>>,
    qr_poll: Option<JoinHandle<()>>,
}

impl LiveAttempt {
    /// End the session, stop its tasks, remove its Working Area.
    /// The pump passes `from_pump` when it shuts down its own attempt; a task
    /// must not abort itself halfway through cleanup.
    async fn shutdown(mut self, bot_id: &str, from_pump: bool) {
        if let Some(handle) = self.qr_poll.take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.take() {
            if !from_pump {
                handle.abort();
            }
        }
        self.session.end().await;
        if let Some(area) = self.area.take() {
            release_area(bot_id, area).await;
        }
    }
}

/// A delayed reinit (retry or post-reset). The token is checked when the
/// timer fires; replacing or clearing the task invalidates it.
struct PendingTask {
    token: u64,
    handle: JoinHandle<()>,
}

struct Entry {
    machine: ConnectionMachine,
    live: Option<LiveAttempt>,
    pending: Option<PendingTask>,
}

/// Remove an area the attempt no longer needs. A failure leaves the directory
/// for the next startup sweep.
async fn release_area(bot_id: &str, area: WorkingArea) {
    let generation = area.generation();
    let path = area.path().to_path_buf();
    if let Err(e) = area.remove().await {
        error!(
            "[whatsapp] {} gen {}: working area {} left behind: {}",
            bot_id,
            generation,
            path.display(),
            e
        );
    }
}

impl Entry {
    /// `generation` seeds the machine so a replacement entry never reports an
    /// older attempt than the one it replaces.
    fn new(bot_id: &str, generation: u64, profile: ClientProfile) -> Self {
        Entry { machine: ConnectionMachine::new(bot_id, generation, profile), live: None, pending: None }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.live.as_ref().is_some_and(|l| l.generation == generation)
    }
}

#[derive(Debug, Clone, Copy)]
enum Followup {
    Retry { profile_index: usize },
    Reinit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

// ── Supervisor ─────────────────────────────────────────────────────────

struct Supervisor {
    config: ConnectionConfig,
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    writer: PersistenceWriter,
    entries: Mutex<HashMap<String, Entry>>,
    op_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Each attempt and each scheduled reinit takes the next value. Old tasks
    /// compare against the live value to know they've been superseded.
    generation: AtomicU64,
    events: broadcast::Sender<StatusEvent>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Supervisor>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BotStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        Ok(ConnectionManager {
            inner: Arc::new(Supervisor {
                policy: RetryPolicy::from_config(&config),
                config,
                transport,
                writer: PersistenceWriter::new(store),
                entries: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        })
    }

    /// Build a manager and clear out Working Areas a previous process left
    /// behind. Use this once per process, before any bot is connected.
    pub async fn start(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BotStore>,
    ) -> EngineResult<Self> {
        let manager = Self::new(config, transport, store)?;
        working_area::purge_orphans(&manager.inner.config.sessions_root).await?;
        Ok(manager)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    // ── Control ────────────────────────────────────────────────────────

    /// Tear down whatever this bot has running and start a fresh attempt.
    /// Returns false if setup failed (see `get_last_error`) or the bot is
    /// terminal and needs `reset_connection`.
    pub async fn init_connection(&self, bot_id: &str) -> bool {
        self.inner.init(bot_id).await
    }

    /// End the session, remove its Working Area, and forget the bot.
    /// Returns false if nothing was registered for it.
    pub async fn close_connection(&self, bot_id: &str) -> bool {
        self.inner.close(bot_id).await
    }

    /// Close, clear retry/error state (leaving terminal), then init after
    /// `reset_delay_ms`.
    pub async fn reset_connection(&self, bot_id: &str) -> bool {
        self.inner.reset(bot_id).await
    }

    /// Close every bot concurrently.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        info!("[whatsapp] Shutting down {} connection(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.inner.close(id))).await;
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn snapshot(&self, bot_id: &str) -> Option<ConnectionSnapshot> {
        self.inner.entries.lock().get(bot_id).map(|e| e.machine.snapshot())
    }

    pub fn get_status(&self, bot_id: &str) -> StatusView {
        let entries = self.inner.entries.lock();
        match entries.get(bot_id) {
            Some(entry) => StatusView {
                qr: entry.machine.qr().map(|q| q.as_str().to_string()),
                connected: entry.machine.status() == ConnectionStatus::Connected,
            },
            None => StatusView::default(),
        }
    }

    pub fn is_connected(&self, bot_id: &str) -> bool {
        self.get_status(bot_id).connected
    }

    pub fn get_qr_code(&self, bot_id: &str) -> Option<String> {
        self.get_status(bot_id).qr
    }

    pub fn get_last_error(&self, bot_id: &str) -> Option<ErrorRecord> {
        self.inner.entries.lock().get(bot_id).and_then(|e| e.machine.last_error().cloned())
    }

    /// Bots with a live transport session, sorted.
    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.live.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Working Area of the live attempt, while it still has one.
    pub fn working_area_path(&self, bot_id: &str) -> Option<PathBuf> {
        let entries = self.inner.entries.lock();
        entries
            .get(bot_id)
            .and_then(|e| e.live.as_ref())
            .and_then(|l| l.area.as_ref())
            .map(|a| a.path().to_path_buf())
    }
}

impl Supervisor {
    fn op_lock(&self, bot_id: &str) -> Arc<AsyncMutex<()>> {
        self.op_locks
            .lock()
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Forget the bot's op lock once nobody else holds or waits on it. The
    /// map's copy and the caller's are the only two references in that case.
    fn release_op_lock(&self, bot_id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.op_locks.lock();
        let unshared = locks.get(bot_id).is_some_and(|l| Arc::ptr_eq(l, lock)) && Arc::strong_count(lock) == 2;
        if unshared {
            locks.remove(bot_id);
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn profile(&self, index: usize) -> ClientProfile {
        self.config.profiles[index % self.config.profiles.len()].clone()
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_current(&self, bot_id: &str, generation: u64) -> bool {
        self.entries.lock().get(bot_id).is_some_and(|e| e.is_live(generation))
    }

    fn live_auth(&self, bot_id: &str, generation: u64) -> Option<Arc<AuthState>> {
        let entries = self.entries.lock();
        entries
            .get(bot_id)
            .and_then(|e| e.live.as_ref())
            .filter(|l| l.generation == generation)
            .map(|l| l.auth.clone())
    }

    // ── Init / close / reset ───────────────────────────────────────────

    async fn init(self: &Arc<Self>, bot_id: &str) -> bool {
        let lock = self.op_lock(bot_id);
        let _guard = lock.lock().await;
        self.init_locked(bot_id).await
    }

    async fn init_locked(self: &Arc<Self>, bot_id: &str) -> bool {
        let profile_index = {
            let entries = self.entries.lock();
            match entries.get(bot_id) {
                Some(e) if e.machine.status() == ConnectionStatus::Terminal => {
                    warn!("[whatsapp] {}: terminal, reset the connection to start again", bot_id);
                    return false;
                }
                Some(e) => e.machine.profile_index(),
                None => 0,
            }
        };

        self.teardown(bot_id).await;

        match self.start_attempt(bot_id, profile_index).await {
            Ok(_) => true,
            Err((generation, e)) => {
                self.record_setup_failure(bot_id, generation, e, false);
                false
            }
        }
    }

    async fn close(&self, bot_id: &str) -> bool {
        let lock = self.op_lock(bot_id);
        let guard = lock.lock().await;

        let existed = self.teardown(bot_id).await;
        let generation = self.entries.lock().remove(bot_id).map(|e| e.machine.generation());
        if existed {
            info!("[whatsapp] {}: connection closed", bot_id);
            self.emit(StatusEvent::new(
                bot_id,
                generation.unwrap_or_default(),
                StatusKind::Closed,
                "Connection closed",
            ));
        }
        self.release_op_lock(bot_id, &lock);
        drop(guard);
        existed
    }

    async fn reset(self: &Arc<Self>, bot_id: &str) -> bool {
        let lock = self.op_lock(bot_id);
        let _guard = lock.lock().await;

        self.teardown(bot_id).await;

        // Retry count, error and terminal status go; the generation carries over.
        let generation = self.entries.lock().get(bot_id).map_or(0, |e| e.machine.generation());
        let mut entry = Entry::new(bot_id, generation, self.profile(0));
        let delay = self.config.reset_delay();
        self.schedule(&mut entry, bot_id, delay, Followup::Reinit);
        self.entries.lock().insert(bot_id.to_string(), entry);

        info!("[whatsapp] {} gen {}: reset, reconnecting in {:?}", bot_id, generation, delay);
        self.emit(StatusEvent::new(bot_id, generation, StatusKind::Starting, "Resetting connection"));
        true
    }

    /// Stop everything registered for the bot: pending timer, live session,
    /// Working Area. The entry itself stays. Returns whether an entry existed.
    async fn teardown(&self, bot_id: &str) -> bool {
        let (live, pending, existed) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(bot_id) {
                Some(entry) => (entry.live.take(), entry.pending.take(), true),
                None => (None, None, false),
            }
        };
        if let Some(task) = pending {
            task.handle.abort();
        }
        if let Some(live) = live {
            info!("[whatsapp] {} gen {}: tearing down", bot_id, live.generation);
            live.shutdown(bot_id, false).await;
        }
        existed
    }

    // ── Attempts ───────────────────────────────────────────────────────

    /// Open a new generation and register it. On failure nothing is
    /// registered; the Working Area (if created) is removed on drop.
    async fn start_attempt(
        self: &Arc<Self>,
        bot_id: &str,
        profile_index: usize,
    ) -> Result<u64, (u64, EngineError)> {
        let generation = self.next_generation();
        let profile = self.profile(profile_index);

        let (area, auth, handle) = match self.open_attempt(bot_id, generation, &profile).await {
            Ok(opened) => opened,
            Err(e) => return Err((generation, e)),
        };
        let TransportHandle { session, events } = handle;
        let attempt = LiveAttempt {
            generation,
            session: session.clone(),
            auth,
            area: Some(area),
            pump: None,
            qr_poll: None,
        };

        // Only an applied start may own a live session.
        let refused = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(bot_id.to_string())
                .or_insert_with(|| Entry::new(bot_id, 0, profile.clone()));
            let outcome = entry.machine.apply(
                generation,
                Input::Started { profile_index, profile: profile.clone() },
            );
            if outcome == Outcome::Applied {
                entry.live = Some(attempt);
                None
            } else {
                Some((attempt, outcome, entry.machine.status()))
            }
        };
        if let Some((attempt, outcome, status)) = refused {
            warn!("[whatsapp] {} gen {}: start {:?} in status {}", bot_id, generation, outcome, status);
            attempt.shutdown(bot_id, false).await;
            return Err((generation, EngineError::setup(format!("start refused in status {}", status))));
        }

        let pump = self.spawn_pump(bot_id, generation, events);
        let qr_poll = self.spawn_qr_poll(bot_id, generation, session);
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(bot_id).and_then(|e| e.live.as_mut()) {
                Some(live) if live.generation == generation => {
                    live.pump = Some(pump);
                    live.qr_poll = Some(qr_poll);
                }
                _ => {
                    pump.abort();
                    qr_poll.abort();
                }
            }
        }

        info!("[whatsapp] {} gen {}: session opened as {}", bot_id, generation, profile);
        self.emit(StatusEvent::new(
            bot_id,
            generation,
            StatusKind::Starting,
            format!("Connecting as {}", profile),
        ));
        Ok(generation)
    }

    async fn open_attempt(
        &self,
        bot_id: &str,
        generation: u64,
        profile: &ClientProfile,
    ) -> EngineResult<(WorkingArea, Arc<AuthState>, TransportHandle)> {
        let area = WorkingArea::create(&self.config.sessions_root, bot_id, generation)
            .await
            .map_err(|e| EngineError::setup(format!("working area: {}", e)))?;
        let auth = Arc::new(
            AuthState::load(area.path())
                .await
                .map_err(|e| EngineError::setup(format!("auth state: {}", e)))?,
        );
        let handle = self
            .transport
            .open(auth.clone(), profile, self.config.protocol_version())
            .await
            .map_err(|e| EngineError::setup(format!("transport open: {}", e)))?;
        Ok((area, auth, handle))
    }

    /// Record a setup failure. Automatic (retry-driven) attempts go back
    /// through the scheduler as RETRY_SIMPLE; manual ones just stop.
    fn record_setup_failure(self: &Arc<Self>, bot_id: &str, generation: u64, err: EngineError, automatic: bool) {
        error!("[whatsapp] {} gen {}: {}", bot_id, generation, err);
        let record = ErrorRecord::new("setup_failed", err.to_string(), ErrorCategory::Setup);

        let plan = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(bot_id.to_string())
                .or_insert_with(|| Entry::new(bot_id, 0, self.profile(0)));
            let plan = automatic.then(|| {
                self.policy.plan(
                    RemediationDecision::RetrySimple,
                    entry.machine.retry_count(),
                    entry.machine.profile_index(),
                )
            });
            let outcome = entry.machine.apply(generation, Input::SetupFailed { error: record, plan });
            if outcome != Outcome::Applied {
                debug!("[whatsapp] {} gen {}: setup failure {:?}", bot_id, generation, outcome);
                return;
            }
            if let Some(RetryPlan::Retry { delay, profile_index, .. }) = plan {
                self.schedule(entry, bot_id, delay, Followup::Retry { profile_index });
            }
            plan
        };

        let kind = match plan {
            Some(RetryPlan::GiveUp) => StatusKind::Terminal,
            Some(RetryPlan::Retry { .. }) => StatusKind::Retrying,
            None => StatusKind::Error,
        };
        self.emit(StatusEvent::new(bot_id, generation, kind, err.to_string()));
    }

    // ── Delayed reinit ─────────────────────────────────────────────────

    fn schedule(self: &Arc<Self>, entry: &mut Entry, bot_id: &str, delay: Duration, followup: Followup) {
        let token = self.next_generation();
        let inner = Arc::clone(self);
        let id = bot_id.to_string();
        let handle = tokio::spawn(async move { inner.run_followup(id, token, delay, followup).await });
        if let Some(previous) = entry.pending.replace(PendingTask { token, handle }) {
            previous.handle.abort();
        }
    }

    async fn run_followup(self: Arc<Self>, bot_id: String, token: u64, delay: Duration, followup: Followup) {
        tokio::time::sleep(delay).await;

        let lock = self.op_lock(&bot_id);
        let _guard = lock.lock().await;

        let profile_index = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&bot_id) else { return };
            let still_wanted = entry.pending.as_ref().is_some_and(|p| p.token == token) && entry.live.is_none();
            if !still_wanted {
                debug!("[whatsapp] {}: scheduled reinit {} superseded", bot_id, token);
                return;
            }
            entry.pending = None;
            entry.machine.clear_retry_scheduled();
            match followup {
                Followup::Retry { profile_index } => profile_index,
                Followup::Reinit => entry.machine.profile_index(),
            }
        };

        let automatic = matches!(followup, Followup::Retry { .. });
        if automatic {
            info!("[whatsapp] {}: retrying", bot_id);
        }
        if let Err((generation, e)) = self.start_attempt(&bot_id, profile_index).await {
            self.record_setup_failure(&bot_id, generation, e, automatic);
        }
    }

    // ── Event pump ─────────────────────────────────────────────────────

    fn spawn_pump(
        self: &Arc<Self>,
        bot_id: &str,
        generation: u64,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let id = bot_id.to_string();
        tokio::spawn(async move { inner.pump(id, generation, events).await })
    }

    async fn pump(
        self: Arc<Self>,
        bot_id: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let lock = self.op_lock(&bot_id);
            let _guard = lock.lock().await;
            if !self.is_current(&bot_id, generation) {
                debug!("[whatsapp] {} gen {}: superseded, dropping {:?}", bot_id, generation, event);
                return;
            }
            if self.handle_event(&bot_id, generation, event).await == Flow::Stop {
                return;
            }
        }

        // Stream ended without a close event.
        let lock = self.op_lock(&bot_id);
        let _guard = lock.lock().await;
        if self.is_current(&bot_id, generation) {
            warn!("[whatsapp] {} gen {}: event stream ended without a close", bot_id, generation);
            let cause = DisconnectCause::new(None, "transport event stream ended");
            self.handle_close(&bot_id, generation, cause).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, bot_id: &str, generation: u64, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::PairingPayload(payload) => {
                self.handle_pairing(bot_id, generation, payload).await;
                Flow::Continue
            }
            TransportEvent::CredentialsUpdated(update) => {
                if let Some(auth) = self.live_auth(bot_id, generation) {
                    if let Err(e) = auth.update_credentials(update).await {
                        warn!("[whatsapp] {} gen {}: credential flush failed: {}", bot_id, generation, e);
                    }
                }
                Flow::Continue
            }
            TransportEvent::Opened => {
                self.handle_opened(bot_id, generation).await;
                Flow::Continue
            }
            TransportEvent::Closed(cause) => {
                self.handle_close(bot_id, generation, cause).await;
                Flow::Stop
            }
        }
    }

    async fn handle_pairing(&self, bot_id: &str, generation: u64, payload: String) {
        let (qr, degraded) = qr::render(payload, self.config.qr_min_dimension).await;
        let degraded = degraded
            .map(|e| ErrorRecord::new("qr_encode_failed", e.to_string(), ErrorCategory::Encoding));
        let shown = qr.as_str().to_string();

        let outcome = {
            let mut entries = self.entries.lock();
            match entries.get_mut(bot_id) {
                Some(entry) if entry.is_live(generation) => {
                    entry.machine.apply(generation, Input::QrReady { qr, degraded })
                }
                _ => Outcome::Stale,
            }
        };

        match outcome {
            Outcome::Applied => {
                info!("[whatsapp] {} gen {}: QR code ready, waiting for scan", bot_id, generation);
                self.emit(
                    StatusEvent::new(bot_id, generation, StatusKind::QrCode, "Scan this QR code with WhatsApp")
                        .with_qr(&shown),
                );
            }
            other => debug!("[whatsapp] {} gen {}: pairing payload {:?}", bot_id, generation, other),
        }
    }

    async fn handle_opened(&self, bot_id: &str, generation: u64) {
        let auth = {
            let entries = self.entries.lock();
            entries
                .get(bot_id)
                .filter(|e| {
                    matches!(e.machine.status(), ConnectionStatus::Initializing | ConnectionStatus::QrPending)
                })
                .and_then(|e| e.live.as_ref())
                .filter(|l| l.generation == generation)
                .map(|l| l.auth.clone())
        };
        let Some(auth) = auth else {
            debug!("[whatsapp] {} gen {}: ignoring open in current state", bot_id, generation);
            return;
        };

        match self.writer.persist(bot_id, &auth).await {
            Ok(_) => {
                let (outcome, area) = {
                    let mut entries = self.entries.lock();
                    match entries.get_mut(bot_id) {
                        Some(entry) if entry.is_live(generation) => {
                            let outcome = entry.machine.apply(generation, Input::Connected);
                            let area = match outcome {
                                Outcome::Applied => entry.live.as_mut().and_then(|l| l.area.take()),
                                _ => None,
                            };
                            (outcome, area)
                        }
                        _ => (Outcome::Stale, None),
                    }
                };
                // Only now that the record is written does the area go.
                if let Some(area) = area {
                    release_area(bot_id, area).await;
                }
                if outcome == Outcome::Applied {
                    info!("[whatsapp] {} gen {}: connected", bot_id, generation);
                    self.emit(StatusEvent::new(bot_id, generation, StatusKind::Connected, "WhatsApp connected"));
                }
            }
            Err(e) => {
                error!("[whatsapp] {} gen {}: {}; keeping working area", bot_id, generation, e);
                let record = ErrorRecord::new("persistence_failed", e.to_string(), ErrorCategory::Persistence);
                {
                    let mut entries = self.entries.lock();
                    if let Some(entry) = entries.get_mut(bot_id) {
                        entry.machine.apply(generation, Input::PersistFailed(record));
                    }
                }
                self.emit(StatusEvent::new(bot_id, generation, StatusKind::Error, e.to_string()));
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, bot_id: &str, generation: u64, cause: DisconnectCause) {
        let decision = classifier::classify(&cause);
        let code = cause
            .status_code
            .map(|c| c.to_string())
            .or_else(|| cause.nested_code.clone())
            .unwrap_or_else(|| "unknown".into());

        let (live, plan) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(bot_id) else { return };
            if !entry.is_live(generation) {
                return;
            }
            let plan = self.policy.plan(decision, entry.machine.retry_count(), entry.machine.profile_index());
            let effective = if plan.is_give_up() { RemediationDecision::GiveUp } else { decision };
            let record = ErrorRecord::new(
                code.clone(),
                cause.message.clone(),
                ErrorCategory::TransportDisconnect(effective),
            );
            entry.machine.apply(generation, Input::Closed { error: record, plan });
            (entry.live.take(), plan)
        };

        // Full teardown of this attempt before anything new is scheduled.
        if let Some(live) = live {
            live.shutdown(bot_id, true).await;
        }

        match plan {
            RetryPlan::GiveUp => {
                warn!(
                    "[whatsapp] {} gen {}: closed ({} {}), giving up ({})",
                    bot_id, generation, code, cause.message, decision
                );
                self.emit(StatusEvent::new(
                    bot_id,
                    generation,
                    StatusKind::Terminal,
                    format!("Disconnected: {}", cause.message),
                ));
            }
            RetryPlan::Retry { delay, decision, profile_index, retry_count } => {
                info!(
                    "[whatsapp] {} gen {}: closed ({} {}), {} #{} in {:?} as {}",
                    bot_id,
                    generation,
                    code,
                    cause.message,
                    decision,
                    retry_count,
                    delay,
                    self.profile(profile_index)
                );
                {
                    let mut entries = self.entries.lock();
                    if let Some(entry) = entries.get_mut(bot_id) {
                        if entry.live.is_none() && entry.machine.generation() == generation {
                            self.schedule(entry, bot_id, delay, Followup::Retry { profile_index });
                        }
                    }
                }
                self.emit(StatusEvent::new(
                    bot_id,
                    generation,
                    StatusKind::Retrying,
                    format!("Reconnecting in {}s", delay.as_secs()),
                ));
            }
        }
    }

    // ── QR fallback poll ───────────────────────────────────────────────

    fn spawn_qr_poll(
        self: &Arc<Self>,
        bot_id: &str,
        generation: u64,
        session: Arc<dyn TransportSession>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let id = bot_id.to_string();
        tokio::spawn(async move { inner.poll_pairing_payload(id, generation, session).await })
    }

    /// Covers a payload the transport produced before the pump was listening.
    /// Stops at the first payload, once the attempt leaves `initializing`,
    /// or when the window closes.
    async fn poll_pairing_payload(
        self: Arc<Self>,
        bot_id: String,
        generation: u64,
        session: Arc<dyn TransportSession>,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.qr_poll_window();
        let interval = self.config.qr_poll_interval();
        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                debug!("[whatsapp] {} gen {}: QR poll window closed", bot_id, generation);
                return;
            }
            if !self.awaiting_first_payload(&bot_id, generation) {
                return;
            }
            let Some(payload) = session.pending_pairing_payload() else { continue };

            let lock = self.op_lock(&bot_id);
            let _guard = lock.lock().await;
            if !self.awaiting_first_payload(&bot_id, generation) {
                return;
            }
            info!("[whatsapp] {} gen {}: pairing payload found by polling the transport", bot_id, generation);
            self.handle_pairing(&bot_id, generation, payload).await;
            return;
        }
    }

    fn awaiting_first_payload(&self, bot_id: &str, generation: u64) -> bool {
        self.entries.lock().get(bot_id).is_some_and(|e| {
            e.is_live(generation) && e.machine.status() == ConnectionStatus::Initializing
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sessions::SessionStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct QuietSession {
        ended: AtomicBool,
    }

    #[async_trait]
    impl TransportSession for QuietSession {
        async fn end(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    /// Opens sessions that never emit anything. Senders are kept so the
    /// event streams stay open.
    #[derive(Default)]
    struct QuietTransport {
        sessions: Mutex<Vec<Arc<QuietSession>>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    }

    #[async_trait]
    impl Transport for QuietTransport {
        async fn open(
            &self,
            _auth: Arc<AuthState>,
            _profile: &ClientProfile,
            _version: crate::atoms::types::ProtocolVersion,
        ) -> EngineResult<TransportHandle> {
            let (tx, events) = mpsc::unbounded_channel();
            let session = Arc::new(QuietSession::default());
            self.sessions.lock().push(session.clone());
            self.senders.lock().push(tx);
            Ok(TransportHandle { session, events })
        }
    }

    fn manager(root: &std::path::Path, transport: Arc<QuietTransport>) -> ConnectionManager {
        let config = ConnectionConfig {
            sessions_root: root.to_path_buf(),
            qr_poll_window_secs: 1,
            ..ConnectionConfig::default()
        };
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        ConnectionManager::new(config, transport, store).unwrap()
    }

    /// Register `bot` as logged out at generation 1.
    fn insert_terminal(sup: &Supervisor, bot_id: &str) {
        let mut entry = Entry::new(bot_id, 0, sup.profile(0));
        entry.machine.apply(1, Input::Started { profile_index: 0, profile: sup.profile(0) });
        let give_up = ErrorCategory::TransportDisconnect(RemediationDecision::GiveUp);
        entry.machine.apply(
            1,
            Input::Closed { error: ErrorRecord::new("logged_out", "logged out", give_up), plan: RetryPlan::GiveUp },
        );
        assert_eq!(entry.machine.status(), ConnectionStatus::Terminal);
        sup.entries.lock().insert(bot_id.into(), entry);
        sup.generation.store(1, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_start_on_terminal_entry_is_undone() {
        let root = tempfile::tempdir().unwrap();
        let transport = Arc::new(QuietTransport::default());
        let manager = manager(root.path(), transport.clone());
        let sup = &manager.inner;
        insert_terminal(sup, "bot");

        let result = sup.start_attempt("bot", 0).await;
        let (generation, err) = result.unwrap_err();
        assert_eq!(generation, 2);
        assert!(err.to_string().contains("start refused"));

        let sessions = transport.sessions.lock().clone();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ended.load(Ordering::SeqCst));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        let entries = sup.entries.lock();
        let entry = entries.get("bot").unwrap();
        assert!(entry.live.is_none());
        assert_eq!(entry.machine.status(), ConnectionStatus::Terminal);
        assert_eq!(entry.machine.generation(), 1);
    }

    #[tokio::test]
    async fn test_refused_start_leaves_last_error_alone() {
        let root = tempfile::tempdir().unwrap();
        let transport = Arc::new(QuietTransport::default());
        let manager = manager(root.path(), transport);
        let sup = &manager.inner;
        insert_terminal(sup, "bot");
        let mut events = manager.subscribe();

        let (generation, err) = sup.start_attempt("bot", 0).await.unwrap_err();
        sup.record_setup_failure("bot", generation, err, true);

        assert_eq!(manager.get_last_error("bot").unwrap().code, "logged_out");
        let entries = sup.entries.lock();
        let entry = entries.get("bot").unwrap();
        assert_eq!(entry.machine.status(), ConnectionStatus::Terminal);
        assert!(entry.pending.is_none());
        drop(entries);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_forgets_op_lock() {
        let root = tempfile::tempdir().unwrap();
        let transport = Arc::new(QuietTransport::default());
        let manager = manager(root.path(), transport);

        for bot in ["a", "b", "c"] {
            assert!(manager.init_connection(bot).await);
        }
        assert_eq!(manager.inner.op_locks.lock().len(), 3);

        for bot in ["a", "b", "c"] {
            assert!(manager.close_connection(bot).await);
        }
        assert!(manager.inner.op_locks.lock().is_empty());

        // Closing an unknown bot leaves nothing behind either.
        assert!(!manager.close_connection("ghost").await);
        assert!(manager.inner.op_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_op_lock_kept_while_shared() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), Arc::new(QuietTransport::default()));
        let sup = &manager.inner;

        let held = sup.op_lock("bot");
        let mine = sup.op_lock("bot");
        sup.release_op_lock("bot", &mine);
        assert!(sup.op_locks.lock().contains_key("bot"));

        drop(held);
        sup.release_op_lock("bot", &mine);
        assert!(!sup.op_locks.lock().contains_key("bot"));
    }
}
