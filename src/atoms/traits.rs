// ── wa-connect Atoms: Collaborator Traits ──────────────────────────────────
// Seams to the outside world that only depend on atoms types. The transport
// trait lives next to the manager (engine/whatsapp/transport.rs) because it
// hands out engine-owned auth state.

use crate::atoms::error::EngineResult;
use crate::atoms::types::PairedSession;
use async_trait::async_trait;

/// Database collaborator used by the Persistence Writer.
///
/// The record is owned by the surrounding application; the manager only ever
/// reads plan durations and writes the paired session as the final step of a
/// successful pairing.
#[async_trait]
pub trait BotStore: Send + Sync {
    /// Subscription that owns this bot, if any.
    async fn subscription_for_bot(&self, bot_id: &str) -> EngineResult<Option<String>>;

    /// Length of the subscription's plan in days.
    async fn plan_duration_days(&self, subscription_id: &str) -> EngineResult<i64>;

    /// Single atomic write of the paired session. Unknown bots are an error.
    async fn write_paired_session(&self, bot_id: &str, session: &PairedSession) -> EngineResult<()>;
}
