// WhatsApp Connection Manager — Transport Seam
// The multi-device wire protocol lives outside this crate. A transport opens
// a session against an AuthState and reports back over an event channel; the
// supervisor never touches protocol details beyond these types.

use super::auth_state::AuthState;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ClientProfile, DisconnectCause, ProtocolVersion};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything a session reports, in emission order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A pending device-link; render it as a QR code.
    PairingPayload(String),
    /// The session is authenticated and open.
    Opened,
    /// The session ended. Always the last event of a session.
    Closed(DisconnectCause),
    /// Partial credential update to merge into the auth state.
    CredentialsUpdated(serde_json::Value),
}

/// What `Transport::open` hands back: the session control handle plus the
/// receiving half of its event stream.
pub struct TransportHandle {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        auth: Arc<AuthState>,
        profile: &ClientProfile,
        version: ProtocolVersion,
    ) -> EngineResult<TransportHandle>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Pairing payload the session already holds, for payloads emitted before
    /// anyone was listening. Transports that cannot tell return `None`.
    fn pending_pairing_payload(&self) -> Option<String> {
        None
    }

    /// Terminate the session. Must be safe to call more than once.
    async fn end(&self);
}
