use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric, negative for group chats).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Telegram message id (numeric, unique per chat).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ChatId {
    /// Telegram encodes group and supergroup chats as negative ids.
    pub fn is_group(&self) -> bool {
        self.0 < 0
    }
}

/// Storage key for one conversation context: sessions are scoped to the
/// (chat, user) pair, so two users driving the bot in the same group chat
/// never share state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub chat: ChatId,
    pub user: UserId,
}

impl SessionKey {
    pub fn new(chat: ChatId, user: UserId) -> Self {
        Self { chat, user }
    }

    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.chat.0, self.user.0)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chat.0, self.user.0)
    }
}
