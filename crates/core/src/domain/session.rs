use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::SuggestedAction;
use crate::domain::ids::{ChatId, SessionKey, UserId};
use crate::machine::states::SessionState;

/// Identity of the person operating the bot, threaded into classifier
/// requests and note attribution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub display_name: String,
    pub username: Option<String>,
}

impl CallerInfo {
    pub fn new(display_name: impl Into<String>, username: Option<String>) -> Self {
        Self { display_name: display_name.into(), username }
    }
}

/// Immutable snapshot of one forwarded message. Produced by the transport,
/// appended to the session queue, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedMessageEntry {
    pub text: String,
    pub sender_name: String,
    pub sender_username: Option<String>,
    pub origin_chat: Option<String>,
    pub forwarded_at: DateTime<Utc>,
    pub has_media: bool,
    pub media_kind: Option<String>,
}

impl ForwardedMessageEntry {
    fn render_line(&self) -> String {
        let mut line = self.sender_name.clone();
        if let Some(username) = &self.sender_username {
            line.push_str(&format!(" (@{username})"));
        }
        if let Some(origin) = &self.origin_chat {
            line.push_str(&format!(" [{origin}]"));
        }
        line.push_str(": ");
        if self.text.is_empty() && self.has_media {
            let kind = self.media_kind.as_deref().unwrap_or("attachment");
            line.push_str(&format!("<{kind}>"));
        } else {
            line.push_str(&self.text);
        }
        line
    }
}

/// Render the queued conversation as note content, one sender-attributed
/// line per forwarded message, in insertion order.
pub fn render_transcript(entries: &[ForwardedMessageEntry]) -> String {
    entries.iter().map(ForwardedMessageEntry::render_line).collect::<Vec<_>>().join("\n")
}

/// Cached CRM object schema, refreshed lazily. Expiry is an explicit
/// timestamp checked on read; there is no refresh timer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCache {
    pub attributes: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaCache {
    pub const MAX_AGE_SECS: i64 = 600;

    pub fn new(attributes: serde_json::Value, fetched_at: DateTime<Utc>) -> Self {
        Self { attributes, fetched_at }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < Duration::seconds(Self::MAX_AGE_SECS)
    }
}

/// Durable per-(chat,user) conversation context. The sole state carried
/// between stateless invocations; every update is a full read-modify-write
/// round trip against the session store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub chat: ChatId,
    pub user: UserId,
    pub state: SessionState,
    pub message_queue: Vec<ForwardedMessageEntry>,
    pub current_action: Option<SuggestedAction>,
    pub current_instruction: Option<String>,
    pub caller: CallerInfo,
    /// Owner lock: only this user may drive confirmation/clarification UI.
    pub initiating_user: UserId,
    pub schema_cache: Option<SchemaCache>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(chat: ChatId, user: UserId, caller: CallerInfo, now: DateTime<Utc>) -> Self {
        Self {
            chat,
            user,
            state: SessionState::Idle,
            message_queue: Vec::new(),
            current_action: None,
            current_instruction: None,
            caller,
            initiating_user: user,
            schema_cache: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.chat, self.user)
    }

    /// Full reset back to idle: queue, action, and instruction are
    /// discarded. The schema cache survives so the next conversation does
    /// not pay another schema fetch.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Idle;
        self.message_queue.clear();
        self.current_action = None;
        self.current_instruction = None;
        self.updated_at = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.initiating_user == user
    }
}
