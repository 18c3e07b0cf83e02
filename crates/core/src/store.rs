//! Session-store contracts. The storage engine is a collaborator; the core
//! only requires get/put/delete per (chat, user) key and a separate
//! TTL-bearing namespace for pending instructions.
//!
//! The store must serialize writes per key: updates are full
//! read-modify-write round trips, and a later write silently clobbers an
//! earlier one if two events for the same session interleave.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ids::{ChatId, MessageId, SessionKey};
use crate::domain::session::{CallerInfo, Session};

/// Correlation window between a free-text instruction and the forward that
/// follows it. Strict: entries older than this are dead on read.
pub const PENDING_INSTRUCTION_TTL_MS: i64 = 2_000;

/// Ephemeral bridge between a typed instruction and a subsequent forward.
/// Keyed by chat, stored outside the session, always short-lived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInstruction {
    pub text: String,
    pub message_id: MessageId,
    pub caller: CallerInfo,
    pub created_at: DateTime<Utc>,
}

impl PendingInstruction {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(PENDING_INSTRUCTION_TTL_MS)
    }

    /// Expiry is checked on read against the caller-supplied clock; there
    /// is no reaper task.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store failure: {0}")]
    Backend(String),
    #[error("stored session could not be decoded: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Option<Session>, StoreError>;
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn remove(&self, key: &SessionKey) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PendingInstructionStore: Send + Sync {
    async fn put(&self, chat: ChatId, pending: PendingInstruction) -> Result<(), StoreError>;

    /// Atomic read-and-delete. Returns the entry only if it is still live
    /// at `now`; expired entries are discarded and reported as absent.
    async fn take_live(
        &self,
        chat: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingInstruction>, StoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{PendingInstruction, PENDING_INSTRUCTION_TTL_MS};
    use crate::domain::ids::MessageId;
    use crate::domain::session::CallerInfo;

    #[test]
    fn liveness_boundary_is_strict() {
        let created = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();
        let pending = PendingInstruction {
            text: "create a person".to_owned(),
            message_id: MessageId(10),
            caller: CallerInfo::new("Ana", None),
            created_at: created,
        };

        assert!(pending.is_live(created + Duration::milliseconds(PENDING_INSTRUCTION_TTL_MS - 1)));
        assert!(!pending.is_live(created + Duration::milliseconds(PENDING_INSTRUCTION_TTL_MS)));
    }
}
