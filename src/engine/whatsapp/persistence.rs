// WhatsApp Connection Manager — Persistence Writer
// read_envelope, PersistenceWriter::persist
//
// Runs once per attempt, on the open transition. Order matters:
//   1. flush the latest credentials into the Working Area
//   2. read the whole area back into a transport-agnostic envelope
//   3. resolve the bot's subscription and its plan duration
//   4. one atomic write of {blob, activated_at, expires_at, status=active}
// Any failure is reported as EngineError::Persistence and nothing is written;
// the caller keeps the Working Area so a later attempt can recover.

use super::auth_state::AuthState;
use crate::atoms::constants::{CREDS_FILE, SESSION_ENVELOPE_FORMAT, TEMP_FILE_PREFIX};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::BotStore;
use crate::atoms::types::{BotStatus, PairedSession};
use chrono::{DateTime, TimeDelta, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Serialised form of a Working Area: the credentials plus every key file,
/// keyed by file stem. Nothing in here depends on the transport library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEnvelope {
    pub format: String,
    pub creds: serde_json::Value,
    pub keys: BTreeMap<String, serde_json::Value>,
    pub captured_at: DateTime<Utc>,
}

/// Read creds.json and every key file from `dir`.
/// A missing or empty creds.json is an error: there is nothing to persist.
pub async fn read_envelope(dir: &Path) -> EngineResult<SessionEnvelope> {
    let creds_bytes = tokio::fs::read(dir.join(CREDS_FILE))
        .await
        .map_err(|e| EngineError::persistence(format!("read {}: {}", CREDS_FILE, e)))?;
    let creds: serde_json::Value = serde_json::from_slice(&creds_bytes)?;
    if creds.as_object().map_or(true, |m| m.is_empty()) {
        return Err(EngineError::persistence("credentials are empty"));
    }

    let mut keys = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == CREDS_FILE || name.starts_with(TEMP_FILE_PREFIX) {
            continue;
        }
        let Some(stem) = name.strip_suffix(".json") else { continue };
        let bytes = tokio::fs::read(entry.path()).await?;
        keys.insert(stem.to_string(), serde_json::from_slice(&bytes)?);
    }

    Ok(SessionEnvelope {
        format: SESSION_ENVELOPE_FORMAT.into(),
        creds,
        keys,
        captured_at: Utc::now(),
    })
}

/// Expiry is a plain calendar-day offset from activation. Non-positive or
/// unrepresentable durations are refused; nothing gets written for them.
pub fn compute_expiry(activated_at: DateTime<Utc>, duration_days: i64) -> EngineResult<DateTime<Utc>> {
    if duration_days <= 0 {
        return Err(EngineError::persistence(format!(
            "plan duration must be positive, got {} days",
            duration_days
        )));
    }
    TimeDelta::try_days(duration_days)
        .and_then(|delta| activated_at.checked_add_signed(delta))
        .ok_or_else(|| EngineError::persistence(format!("plan duration of {} days is out of range", duration_days)))
}

pub struct PersistenceWriter {
    store: Arc<dyn BotStore>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn BotStore>) -> Self {
        PersistenceWriter { store }
    }

    pub async fn persist(&self, bot_id: &str, auth: &AuthState) -> EngineResult<PairedSession> {
        self.persist_inner(bot_id, auth).await.map_err(EngineError::into_persistence)
    }

    async fn persist_inner(&self, bot_id: &str, auth: &AuthState) -> EngineResult<PairedSession> {
        auth.persist().await?;
        let envelope = read_envelope(auth.dir()).await?;
        let session_blob = serde_json::to_string(&envelope)?;

        let subscription_id = self
            .store
            .subscription_for_bot(bot_id)
            .await?
            .ok_or_else(|| EngineError::persistence(format!("bot '{}' has no subscription", bot_id)))?;
        let duration_days = self.store.plan_duration_days(&subscription_id).await?;

        let activated_at = Utc::now();
        let session = PairedSession {
            session_blob,
            activated_at,
            expires_at: compute_expiry(activated_at, duration_days)?,
            status: BotStatus::Active,
        };
        self.store.write_paired_session(bot_id, &session).await?;

        info!(
            "[whatsapp] {}: paired session stored ({} key files, expires {})",
            bot_id,
            envelope.keys.len(),
            session.expires_at.to_rfc3339()
        );
        Ok(session)
    }
}
