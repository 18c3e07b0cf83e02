use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use dossier_core::domain::ids::{ChatId, SessionKey};
use dossier_core::domain::session::Session;
use dossier_core::store::{
    PendingInstruction, PendingInstructionStore, SessionStore, StoreError,
};

/// In-memory session store. The single write lock per map gives the
/// per-key write serialization the engine relies on.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(&key.storage_key()).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.write().await.insert(session.key().storage_key(), session.clone());
        Ok(())
    }

    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.sessions.write().await.remove(&key.storage_key());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPendingStore {
    entries: RwLock<HashMap<i64, PendingInstruction>>,
}

#[async_trait]
impl PendingInstructionStore for InMemoryPendingStore {
    async fn put(&self, chat: ChatId, pending: PendingInstruction) -> Result<(), StoreError> {
        self.entries.write().await.insert(chat.0, pending);
        Ok(())
    }

    async fn take_live(
        &self,
        chat: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingInstruction>, StoreError> {
        // Remove-then-check keeps the read-and-delete atomic under the
        // write lock; an expired entry is dropped, not returned.
        match self.entries.write().await.remove(&chat.0) {
            Some(pending) if pending.is_live(now) => Ok(Some(pending)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use dossier_core::domain::ids::{ChatId, MessageId, SessionKey, UserId};
    use dossier_core::domain::session::{CallerInfo, Session};
    use dossier_core::store::{PendingInstruction, PendingInstructionStore, SessionStore};

    use super::{InMemoryPendingStore, InMemorySessionStore};

    #[tokio::test]
    async fn session_round_trip() {
        let store = InMemorySessionStore::default();
        let session =
            Session::new(ChatId(1), UserId(2), CallerInfo::new("Ana", None), Utc::now());

        store.save(&session).await.expect("save");
        let loaded = store.load(&SessionKey::new(ChatId(1), UserId(2))).await.expect("load");
        assert_eq!(loaded, Some(session));

        store.remove(&SessionKey::new(ChatId(1), UserId(2))).await.expect("remove");
        assert!(store.load(&SessionKey::new(ChatId(1), UserId(2))).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn expired_pending_entries_are_dropped_on_read() {
        let store = InMemoryPendingStore::default();
        let created = Utc::now();
        store
            .put(
                ChatId(5),
                PendingInstruction {
                    text: "create a deal".to_owned(),
                    message_id: MessageId(9),
                    caller: CallerInfo::default(),
                    created_at: created,
                },
            )
            .await
            .expect("put");

        let claimed =
            store.take_live(ChatId(5), created + Duration::seconds(10)).await.expect("take");
        assert!(claimed.is_none());
    }
}
