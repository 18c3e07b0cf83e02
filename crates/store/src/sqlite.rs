//! Durable sqlite-backed stores. Sessions are stored as one JSON blob per
//! (chat, user) key; WAL plus busy_timeout give per-key write serialization
//! across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use dossier_core::domain::ids::{ChatId, SessionKey};
use dossier_core::domain::session::Session;
use dossier_core::store::{
    PendingInstruction, PendingInstructionStore, SessionStore, StoreError,
};

use crate::DbPool;

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT payload FROM sessions WHERE session_key = ?")
            .bind(key.storage_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload)
                    .map(Some)
                    .map_err(|error| StoreError::Corrupt(error.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let payload = serde_json::to_string(session)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        sqlx::query(
            "INSERT INTO sessions (session_key, chat_id, user_id, payload, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(session_key) DO UPDATE SET payload = excluded.payload, \
             updated_at = excluded.updated_at",
        )
        .bind(session.key().storage_key())
        .bind(session.chat.0)
        .bind(session.user.0)
        .bind(payload)
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_key = ?")
            .bind(key.storage_key())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqlitePendingStore {
    pool: DbPool,
}

impl SqlitePendingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PendingInstructionStore for SqlitePendingStore {
    async fn put(&self, chat: ChatId, pending: PendingInstruction) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&pending)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        sqlx::query(
            "INSERT INTO pending_instructions (chat_id, payload, expires_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET payload = excluded.payload, \
             expires_at = excluded.expires_at",
        )
        .bind(chat.0)
        .bind(payload)
        .bind(pending.expires_at().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn take_live(
        &self,
        chat: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingInstruction>, StoreError> {
        // DELETE .. RETURNING makes the read-and-delete one statement, so
        // a forward burst claims the entry exactly once.
        let row = sqlx::query("DELETE FROM pending_instructions WHERE chat_id = ? RETURNING payload")
            .bind(chat.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.get("payload");
        let pending: PendingInstruction = serde_json::from_str(&payload)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;

        Ok(pending.is_live(now).then_some(pending))
    }
}
