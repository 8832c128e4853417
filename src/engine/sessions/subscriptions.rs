use rusqlite::params;
use serde::{Deserialize, Serialize};
use crate::atoms::error::{EngineError, EngineResult};
use super::SessionStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub duration_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub plan_id: String,
    pub owner: String,
}

impl SessionStore {
    // ── Plans ──────────────────────────────────────────────────────────

    pub fn create_plan(&self, id: &str, name: &str, duration_days: i64) -> EngineResult<Plan> {
        if duration_days <= 0 {
            return Err(EngineError::Config(format!("Plan duration must be positive, got {}", duration_days)));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO plans (id, name, duration_days) VALUES (?1, ?2, ?3)",
            params![id, name, duration_days],
        )?;
        Ok(Plan { id: id.into(), name: name.into(), duration_days })
    }

    pub fn list_plans(&self) -> EngineResult<Vec<Plan>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, duration_days FROM plans ORDER BY id")?;
        let plans = stmt
            .query_map([], |row| {
                Ok(Plan { id: row.get(0)?, name: row.get(1)?, duration_days: row.get(2)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(plans)
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    pub fn create_subscription(&self, id: &str, plan_id: &str, owner: &str) -> EngineResult<Subscription> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscriptions (id, plan_id, owner) VALUES (?1, ?2, ?3)",
            params![id, plan_id, owner],
        )?;
        Ok(Subscription { id: id.into(), plan_id: plan_id.into(), owner: owner.into() })
    }

    /// Plan duration for a subscription, joined through its plan.
    pub fn subscription_plan_days(&self, subscription_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT p.duration_days FROM subscriptions s \
             JOIN plans p ON p.id = s.plan_id WHERE s.id = ?1",
            params![subscription_id],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(days) => Ok(days),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(EngineError::Other(format!(
                "Subscription '{}' has no plan", subscription_id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_days_through_subscription() {
        let store = SessionStore::open_in_memory().unwrap();
        store.create_plan("monthly", "Monthly", 30).unwrap();
        store.create_subscription("sub-1", "monthly", "alice").unwrap();

        assert_eq!(store.subscription_plan_days("sub-1").unwrap(), 30);
        assert!(store.subscription_plan_days("sub-missing").is_err());
    }

    #[test]
    fn test_rejects_non_positive_duration() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(matches!(store.create_plan("free", "Free", 0), Err(EngineError::Config(_))));
        assert!(store.list_plans().unwrap().is_empty());
    }
}
