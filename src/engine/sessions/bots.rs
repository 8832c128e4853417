use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, OptionalExtension, Row};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BotRecord, BotStatus, PairedSession};
use super::{format_ts, parse_ts, SessionStore};

const BOT_COLUMNS: &str = "id, subscription_id, session_blob, activated_at, expires_at, status";

fn row_to_bot(row: &Row<'_>) -> rusqlite::Result<BotRecord> {
    let status: String = row.get(5)?;
    Ok(BotRecord {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        session_blob: row.get(2)?,
        activated_at: parse_ts(row.get(3)?),
        expires_at: parse_ts(row.get(4)?),
        status: BotStatus::parse(&status).unwrap_or(BotStatus::Pending),
    })
}

impl SessionStore {
    // ── Bot CRUD ───────────────────────────────────────────────────────

    pub fn create_bot(&self, id: &str, subscription_id: Option<&str>) -> EngineResult<BotRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bots (id, subscription_id, status) VALUES (?1, ?2, 'pending')",
            params![id, subscription_id],
        )?;
        Ok(BotRecord {
            id: id.into(),
            subscription_id: subscription_id.map(str::to_string),
            session_blob: None,
            activated_at: None,
            expires_at: None,
            status: BotStatus::Pending,
        })
    }

    pub fn get_bot(&self, id: &str) -> EngineResult<Option<BotRecord>> {
        let conn = self.conn.lock();
        let bot = conn
            .query_row(
                &format!("SELECT {} FROM bots WHERE id = ?1", BOT_COLUMNS),
                params![id],
                row_to_bot,
            )
            .optional()?;
        Ok(bot)
    }

    pub fn list_bots(&self) -> EngineResult<Vec<BotRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM bots ORDER BY id", BOT_COLUMNS))?;
        let bots = stmt.query_map([], row_to_bot)?.collect::<Result<Vec<_>, _>>()?;
        Ok(bots)
    }

    pub(crate) fn bot_subscription(&self, bot_id: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let sub = conn
            .query_row(
                "SELECT subscription_id FROM bots WHERE id = ?1",
                params![bot_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(sub.flatten())
    }

    // ── Paired session write ───────────────────────────────────────────

    /// One UPDATE carrying every field, so the record is never half-written.
    pub(crate) fn store_paired_session(&self, bot_id: &str, session: &PairedSession) -> EngineResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE bots SET session_blob = ?2, activated_at = ?3, expires_at = ?4, \
             status = ?5, updated_at = datetime('now') WHERE id = ?1",
            params![
                bot_id,
                session.session_blob,
                format_ts(&session.activated_at),
                format_ts(&session.expires_at),
                session.status.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::Other(format!("Unknown bot '{}'", bot_id)));
        }
        Ok(())
    }

    // ── Expiration contract ────────────────────────────────────────────

    /// Flip every active bot whose expiry has passed to `expired` and drop its
    /// session blob. Returns the number of bots expired.
    pub fn expire_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let expired = conn.execute(
            "UPDATE bots SET status = 'expired', session_blob = NULL, updated_at = datetime('now') \
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
            params![format_ts(&now)],
        )?;
        if expired > 0 {
            info!("[engine] Expired {} bot(s)", expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_bot() -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_plan("monthly", "Monthly", 30).unwrap();
        store.create_subscription("sub-1", "monthly", "alice").unwrap();
        store.create_bot("bot-1", Some("sub-1")).unwrap();
        store
    }

    fn paired(activated_at: DateTime<Utc>, days: i64) -> PairedSession {
        PairedSession {
            session_blob: "{\"creds\":{}}".into(),
            activated_at,
            expires_at: activated_at + Duration::days(days),
            status: BotStatus::Active,
        }
    }

    #[test]
    fn test_store_paired_session() {
        let store = store_with_bot();
        let now = Utc::now();
        store.store_paired_session("bot-1", &paired(now, 30)).unwrap();

        let bot = store.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(bot.status, BotStatus::Active);
        assert_eq!(bot.session_blob.as_deref(), Some("{\"creds\":{}}"));
        let activated = bot.activated_at.unwrap();
        assert_eq!(bot.expires_at.unwrap() - activated, Duration::days(30));
    }

    #[test]
    fn test_store_paired_session_unknown_bot() {
        let store = store_with_bot();
        assert!(store.store_paired_session("ghost", &paired(Utc::now(), 1)).is_err());
    }

    #[test]
    fn test_bot_subscription_lookup() {
        let store = store_with_bot();
        store.create_bot("bot-2", None).unwrap();
        assert_eq!(store.bot_subscription("bot-1").unwrap().as_deref(), Some("sub-1"));
        assert_eq!(store.bot_subscription("bot-2").unwrap(), None);
        assert_eq!(store.bot_subscription("ghost").unwrap(), None);
    }

    #[test]
    fn test_expire_due_only_touches_lapsed_active_bots() {
        let store = store_with_bot();
        store.create_bot("bot-2", Some("sub-1")).unwrap();
        store.create_bot("bot-3", Some("sub-1")).unwrap();

        let now = Utc::now();
        store.store_paired_session("bot-1", &paired(now - Duration::days(31), 30)).unwrap();
        store.store_paired_session("bot-2", &paired(now, 30)).unwrap();

        assert_eq!(store.expire_due(now).unwrap(), 1);
        let lapsed = store.get_bot("bot-1").unwrap().unwrap();
        assert_eq!(lapsed.status, BotStatus::Expired);
        assert!(lapsed.session_blob.is_none());
        assert_eq!(store.get_bot("bot-2").unwrap().unwrap().status, BotStatus::Active);
        assert_eq!(store.get_bot("bot-3").unwrap().unwrap().status, BotStatus::Pending);

        assert_eq!(store.expire_due(now).unwrap(), 0);
    }
}
