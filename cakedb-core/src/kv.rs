//! Checkpoint store: a tiny key/value table inside the main database.
//!
//! The `kv` table itself is created by the application's migrations.

use rusqlite::types::Value;
use std::sync::Arc;

use crate::database::Database;
use crate::error::Result;

/// Key holding the id of the newest applied revision.
pub const REVISION_POINT: &str = "revision_point";

pub const KV_TABLE: &str = "kv";

#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
}

impl KvStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let rows = self
            .db
            .query(
                "SELECT value FROM kv WHERE key = ?1 LIMIT 1",
                vec![Value::Text(key.to_string())],
            )
            .await?;
        Ok(rows.first().and_then(|r| match r.get("value") {
            Some(Value::Text(s)) => Some(s.clone()),
            Some(Value::Integer(i)) => Some(i.to_string()),
            _ => None,
        }))
    }

    /// Insert the key if absent, otherwise update it in place.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let params = vec![Value::Text(value.to_string()), Value::Text(key.to_string())];
        if self.get(key).await?.is_none() {
            self.db
                .execute("INSERT INTO kv (value, key) VALUES (?1, ?2)", params)
                .await?;
        } else {
            self.db
                .execute("UPDATE kv SET value = ?1 WHERE key = ?2", params)
                .await?;
        }
        Ok(())
    }

    /// Current `revision_point`, if any.
    pub async fn checkpoint(&self) -> Result<Option<String>> {
        self.get(REVISION_POINT).await
    }

    pub async fn set_checkpoint(&self, revision_id: &str) -> Result<()> {
        self.put(REVISION_POINT, revision_id).await
    }
}
