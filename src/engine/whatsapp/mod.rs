// WhatsApp Connection Manager
//
// Module layout:
//   config       — ConnectionConfig, client profiles, load/save via engine_config
//   working_area — per-attempt credential directory, orphan purge
//   auth_state   — credentials + key files inside a Working Area
//   transport    — Transport / TransportSession seam, TransportEvent
//   qr           — pairing payload → SVG data URI (raw fallback)
//   classifier   — DisconnectCause → RemediationDecision
//   retry        — RetryPolicy: backoff, ceiling, profile rotation
//   machine      — ConnectionMachine, the generation-checked state machine
//   persistence  — PersistenceWriter: Working Area → bot record
//   events       — StatusEvent broadcast
//   bridge       — ConnectionManager: init/close/reset, event pump, retries

pub mod auth_state;
pub mod bridge;
pub mod classifier;
pub mod config;
pub mod events;
pub mod machine;
pub mod persistence;
pub mod qr;
pub mod retry;
pub mod transport;
pub mod working_area;

// ── Re-exports ─────────────────────────────────────────────────────────

pub use auth_state::AuthState;
pub use bridge::ConnectionManager;
pub use classifier::{classify, classify_parts};
pub use config::{default_profiles, load_config, save_config, ConnectionConfig};
pub use events::{StatusEvent, StatusKind};
pub use persistence::{read_envelope, PersistenceWriter, SessionEnvelope};
pub use retry::{RetryPlan, RetryPolicy};
pub use transport::{Transport, TransportEvent, TransportHandle, TransportSession};
pub use working_area::{purge_orphans, WorkingArea};
