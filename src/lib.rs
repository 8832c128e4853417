// wa-connect — per-bot WhatsApp multi-device connection manager
//
//   atoms  — constants, error type, shared types, store trait
//   engine — connection supervisor, session store, paths

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::traits::BotStore;
pub use atoms::types::{
    BotRecord, BotStatus, ClientProfile, ConnectionSnapshot, ConnectionStatus, DisconnectCause,
    ErrorCategory, ErrorRecord, PairedSession, ProtocolVersion, QrData, RemediationDecision,
    StatusView,
};
pub use engine::sessions::SessionStore;
pub use engine::whatsapp::{ConnectionConfig, ConnectionManager, StatusEvent, StatusKind};
