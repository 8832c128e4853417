// wa-connect Engine — Bot Store
// Plans, subscriptions, and bot records in SQLite via rusqlite.
// This is the Database collaborator the Persistence Writer talks to; the
// surrounding application owns the data, the manager only reads plan
// durations and writes paired sessions.
//
// Module layout:
//   schema         — idempotent migrations
//   subscriptions  — plan + subscription CRUD, plan duration lookup
//   bots           — bot CRUD, paired-session write, expiration sweep
//   config         — key/value engine config store

use crate::atoms::error::EngineResult;
use crate::atoms::traits::BotStore;
use crate::atoms::types::PairedSession;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod bots;
mod config;
mod schema;
mod subscriptions;

pub use subscriptions::{Plan, Subscription};

/// Thread-safe database wrapper.
pub struct SessionStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need to poke at rows directly.
    pub conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the database at `path` and initialize tables.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[engine] Opening bot store at {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys = ON;").ok();

        schema::run_migrations(&conn)?;

        Ok(SessionStore { conn: Mutex::new(conn) })
    }

    /// Private in-memory database with the full schema.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(SessionStore { conn: Mutex::new(conn) })
    }
}

// Timestamps are stored as fixed-width UTC RFC 3339 text so that SQL string
// comparison orders them correctly (the expiration sweep relies on this).
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

// ── BotStore implementation ──────────────────────────────────────────────────
// rusqlite is synchronous; every call holds the connection lock only for a
// single short statement.

#[async_trait]
impl BotStore for SessionStore {
    async fn subscription_for_bot(&self, bot_id: &str) -> EngineResult<Option<String>> {
        self.bot_subscription(bot_id)
    }

    async fn plan_duration_days(&self, subscription_id: &str) -> EngineResult<i64> {
        self.subscription_plan_days(subscription_id)
    }

    async fn write_paired_session(&self, bot_id: &str, session: &PairedSession) -> EngineResult<()> {
        self.store_paired_session(bot_id, session)
    }
}
