// ── wa-connect Atoms: Pure Data Types ─────────────────────────────────────────
// All plain struct/enum definitions shared between the connection manager,
// the store, and callers. Atoms layer rule: no I/O, no side effects, no imports
// from engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Initializing,
    QrPending,
    Connected,
    Disconnected,
    Terminal,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::QrPending => "qr_pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Terminal => "terminal",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the UI should show for a pending pairing.
/// `Image` is a ready-to-embed data URI; `Raw` is the untouched pairing payload
/// for client-side rendering when server-side encoding failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QrData {
    Image(String),
    Raw(String),
}

impl QrData {
    pub fn as_str(&self) -> &str {
        match self {
            QrData::Image(s) | QrData::Raw(s) => s,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, QrData::Raw(_))
    }
}

// ── Disconnects & remediation ──────────────────────────────────────────────

/// Structured close cause as reported by the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectCause {
    /// Protocol-level status code (401 logged out, 515 restart required, …).
    pub status_code: Option<u16>,
    pub message: String,
    /// Code carried by a nested stream error node, when present.
    pub nested_code: Option<String>,
}

impl DisconnectCause {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        DisconnectCause { status_code, message: message.into(), nested_code: None }
    }

    pub fn with_nested(mut self, code: impl Into<String>) -> Self {
        self.nested_code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemediationDecision {
    GiveUp,
    RetrySimple,
    RetryDifferentApproach,
}

impl fmt::Display for RemediationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemediationDecision::GiveUp => "GIVE_UP",
            RemediationDecision::RetrySimple => "RETRY_SIMPLE",
            RemediationDecision::RetryDifferentApproach => "RETRY_DIFFERENT_APPROACH",
        })
    }
}

// ── Errors as seen by callers ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "decision", rename_all = "snake_case")]
pub enum ErrorCategory {
    Setup,
    TransportDisconnect(RemediationDecision),
    Persistence,
    Encoding,
}

/// Last failure recorded against a bot. Callers poll this instead of
/// receiving errors from the public API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        ErrorRecord {
            code: code.into(),
            message: message.into(),
            category,
            timestamp: Utc::now(),
        }
    }
}

// ── Client fingerprint ─────────────────────────────────────────────────────

/// (name, platform, version) triple presented to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientProfile {
    pub name: String,
    pub platform: String,
    pub version: String,
}

impl ClientProfile {
    pub fn new(name: &str, platform: &str, version: &str) -> Self {
        ClientProfile { name: name.into(), platform: platform.into(), version: version.into() }
    }
}

impl fmt::Display for ClientProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} {}", self.name, self.platform, self.version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

// ── Snapshots returned to callers ──────────────────────────────────────────

/// Full per-bot state, serialisable for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSnapshot {
    pub bot_id: String,
    pub status: ConnectionStatus,
    pub qr: Option<QrData>,
    pub retry_count: u32,
    pub last_error: Option<ErrorRecord>,
    pub generation: u64,
    pub profile: ClientProfile,
    /// True while a delayed reinit is waiting to fire.
    pub retry_scheduled: bool,
}

/// The `{qr, connected}` pair HTTP callers poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusView {
    pub qr: Option<String>,
    pub connected: bool,
}

// ── Persisted bot record ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Pending,
    Active,
    Expired,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Pending => "pending",
            BotStatus::Active => "active",
            BotStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BotStatus::Pending),
            "active" => Some(BotStatus::Active),
            "expired" => Some(BotStatus::Expired),
            _ => None,
        }
    }
}

/// What the Persistence Writer stores after a successful pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairedSession {
    pub session_blob: String,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: BotStatus,
}

/// A row of the bots table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotRecord {
    pub id: String,
    pub subscription_id: Option<String>,
    pub session_blob: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: BotStatus,
}
