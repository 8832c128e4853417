// WhatsApp Connection Manager — Status Events
// Push-side mirror of the snapshot: every state change is broadcast so a UI
// can react without polling. Delivery is best effort; a subscriber that falls
// more than STATUS_EVENT_CAPACITY events behind skips ahead.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Starting,
    QrCode,
    Connected,
    Error,
    Retrying,
    Terminal,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub bot_id: String,
    pub generation: u64,
    pub kind: StatusKind,
    pub message: String,
    /// Rendered QR (data URI or raw payload) for `QrCode` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

impl StatusEvent {
    pub fn new(bot_id: &str, generation: u64, kind: StatusKind, message: impl Into<String>) -> Self {
        StatusEvent {
            bot_id: bot_id.into(),
            generation,
            kind,
            message: message.into(),
            qr: None,
        }
    }

    pub fn with_qr(mut self, qr: &str) -> Self {
        self.qr = Some(qr.into());
        self
    }
}
