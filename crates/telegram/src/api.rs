//! Telegram Bot API client and wire-format decoding. This is the only
//! place raw Telegram payloads are parsed; everything downstream works on
//! the typed event model.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use dossier_core::domain::ids::{ChatId, MessageId, UserId};
use dossier_core::domain::session::{CallerInfo, ForwardedMessageEntry};

use crate::commands::parse_command;
use crate::events::{
    CallbackEvent, CommandEvent, ForwardedEvent, InboundEvent, TextEvent, UpdateEnvelope,
};
use crate::poller::{TelegramTransport, TransportError};
use crate::render::OutboundMessage;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("telegram transport failure: {0}")]
    Transport(String),
    #[error("telegram rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn send_message(
        &self,
        chat: ChatId,
        outbound: &OutboundMessage,
    ) -> Result<MessageId, ApiError>;

    async fn edit_message(
        &self,
        chat: ChatId,
        message: MessageId,
        outbound: &OutboundMessage,
    ) -> Result<(), ApiError>;

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ApiError>;
}

pub struct HttpTelegramApi {
    client: reqwest::Client,
    token: SecretString,
    base_url: String,
    poll_timeout_secs: u64,
    offset: Mutex<i64>,
    buffer: Mutex<VecDeque<UpdateEnvelope>>,
}

impl HttpTelegramApi {
    pub fn new(token: SecretString, poll_timeout_secs: u64) -> Self {
        Self::with_base_url(token, poll_timeout_secs, "https://api.telegram.org".to_owned())
    }

    pub fn with_base_url(token: SecretString, poll_timeout_secs: u64, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url,
            poll_timeout_secs,
            offset: Mutex::new(0),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token.expose_secret())
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|error| ApiError::Transport(error.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|error| ApiError::Transport(error.to_string()))?;

        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = payload
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ApiError::Rejected(description.to_owned()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    fn message_body(chat: ChatId, outbound: &OutboundMessage) -> Value {
        let mut body = json!({
            "chat_id": chat.0,
            "text": outbound.text,
        });
        if let Some(keyboard) = &outbound.keyboard {
            let rows: Vec<Vec<Value>> = keyboard
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|button| {
                            json!({ "text": button.label, "callback_data": button.callback_data })
                        })
                        .collect()
                })
                .collect();
            body["reply_markup"] = json!({ "inline_keyboard": rows });
        }
        body
    }
}

#[async_trait]
impl TelegramApi for HttpTelegramApi {
    async fn send_message(
        &self,
        chat: ChatId,
        outbound: &OutboundMessage,
    ) -> Result<MessageId, ApiError> {
        let result = self.call("sendMessage", Self::message_body(chat, outbound)).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ApiError::Rejected("sendMessage returned no message_id".to_owned()))?;
        Ok(MessageId(message_id))
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message: MessageId,
        outbound: &OutboundMessage,
    ) -> Result<(), ApiError> {
        let mut body = Self::message_body(chat, outbound);
        body["message_id"] = json!(message.0);
        self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ApiError> {
        self.call("answerCallbackQuery", json!({ "callback_query_id": callback_id })).await?;
        Ok(())
    }
}

#[async_trait]
impl TelegramTransport for HttpTelegramApi {
    async fn next_update(&self) -> Result<Option<UpdateEnvelope>, TransportError> {
        if let Some(buffered) = self.buffer.lock().await.pop_front() {
            return Ok(Some(buffered));
        }

        let offset = *self.offset.lock().await;
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": self.poll_timeout_secs,
                    "allowed_updates": ["message", "callback_query"],
                }),
            )
            .await
            .map_err(|error| TransportError::Receive(error.to_string()))?;

        let Some(updates) = result.as_array() else {
            return Ok(None);
        };

        let mut buffer = self.buffer.lock().await;
        let mut next_offset = offset;
        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                next_offset = next_offset.max(update_id + 1);
            }
            if let Some(envelope) = decode_update(update) {
                buffer.push_back(envelope);
            } else {
                debug!(event_name = "telegram.update_undecodable", "skipping update");
            }
        }
        *self.offset.lock().await = next_offset;
        Ok(buffer.pop_front())
    }
}

/// Decode one raw update into the typed event model. Unknown shapes come
/// back as `Unsupported`, undecodable ones as `None`.
pub fn decode_update(update: &Value) -> Option<UpdateEnvelope> {
    let update_id = update.get("update_id").and_then(Value::as_i64)?;

    if let Some(callback) = update.get("callback_query") {
        let chat = ChatId(callback.pointer("/message/chat/id").and_then(Value::as_i64)?);
        let user = UserId(callback.pointer("/from/id").and_then(Value::as_i64)?);
        return Some(UpdateEnvelope {
            update_id,
            event: InboundEvent::Callback(CallbackEvent {
                chat,
                user,
                caller: caller_info(callback.get("from")),
                callback_id: callback.get("id").and_then(Value::as_str)?.to_owned(),
                data: callback.get("data").and_then(Value::as_str).unwrap_or("").to_owned(),
            }),
        });
    }

    let Some(message) = update.get("message") else {
        let kind = update
            .as_object()
            .and_then(|object| object.keys().find(|key| *key != "update_id").cloned())
            .unwrap_or_else(|| "unknown".to_owned());
        return Some(UpdateEnvelope { update_id, event: InboundEvent::Unsupported { kind } });
    };

    let chat = ChatId(message.pointer("/chat/id").and_then(Value::as_i64)?);
    let user = UserId(message.pointer("/from/id").and_then(Value::as_i64)?);
    let caller = caller_info(message.get("from"));
    let message_id = MessageId(message.get("message_id").and_then(Value::as_i64)?);
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();

    if let Some(entry) = forwarded_entry(message, &text) {
        return Some(UpdateEnvelope {
            update_id,
            event: InboundEvent::Forwarded(ForwardedEvent { chat, user, caller, entry }),
        });
    }

    if let Some((name, args)) = parse_command(&text) {
        return Some(UpdateEnvelope {
            update_id,
            event: InboundEvent::Command(CommandEvent { chat, user, caller, name, args }),
        });
    }

    if !text.is_empty() {
        return Some(UpdateEnvelope {
            update_id,
            event: InboundEvent::Text(TextEvent { chat, user, caller, message_id, text }),
        });
    }

    Some(UpdateEnvelope {
        update_id,
        event: InboundEvent::Unsupported { kind: "message".to_owned() },
    })
}

fn caller_info(from: Option<&Value>) -> CallerInfo {
    let Some(from) = from else {
        return CallerInfo::default();
    };
    let first = from.get("first_name").and_then(Value::as_str).unwrap_or("");
    let last = from.get("last_name").and_then(Value::as_str).unwrap_or("");
    let display_name = match (first.is_empty(), last.is_empty()) {
        (false, false) => format!("{first} {last}"),
        (false, true) => first.to_owned(),
        _ => last.to_owned(),
    };
    CallerInfo {
        display_name,
        username: from.get("username").and_then(Value::as_str).map(str::to_owned),
    }
}

/// Build the immutable queue entry for a forwarded message. Supports the
/// `forward_origin` shape and the legacy `forward_from` fields.
fn forwarded_entry(message: &Value, text: &str) -> Option<ForwardedMessageEntry> {
    let origin = message.get("forward_origin");
    let legacy_from = message.get("forward_from");
    let legacy_hidden = message.get("forward_sender_name");
    if origin.is_none() && legacy_from.is_none() && legacy_hidden.is_none() {
        return None;
    }

    let (sender_name, sender_username, origin_chat) = if let Some(origin) = origin {
        match origin.get("type").and_then(Value::as_str) {
            Some("user") => {
                let caller = caller_info(origin.get("sender_user"));
                (caller.display_name, caller.username, None)
            }
            Some("hidden_user") => (
                origin
                    .get("sender_user_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown sender")
                    .to_owned(),
                None,
                None,
            ),
            Some("chat") | Some("channel") => {
                let title = origin
                    .pointer("/chat/title")
                    .or_else(|| origin.pointer("/sender_chat/title"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                (title.clone().unwrap_or_else(|| "Unknown chat".to_owned()), None, title)
            }
            _ => ("Unknown sender".to_owned(), None, None),
        }
    } else if let Some(from) = legacy_from {
        let caller = caller_info(Some(from));
        (caller.display_name, caller.username, None)
    } else {
        (
            legacy_hidden.and_then(Value::as_str).unwrap_or("Unknown sender").to_owned(),
            None,
            None,
        )
    };

    let forwarded_at = message
        .get("forward_date")
        .or_else(|| origin.and_then(|origin| origin.get("date")))
        .and_then(Value::as_i64)
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        .unwrap_or_else(Utc::now);

    let media_kind = ["photo", "document", "video", "voice", "audio", "sticker"]
        .into_iter()
        .find(|kind| message.get(kind).is_some())
        .map(str::to_owned);

    Some(ForwardedMessageEntry {
        text: text.to_owned(),
        sender_name,
        sender_username,
        origin_chat,
        forwarded_at,
        has_media: media_kind.is_some(),
        media_kind,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::decode_update;
    use crate::events::InboundEvent;

    #[test]
    fn decodes_forwarded_message_with_origin_user() {
        let update = json!({
            "update_id": 100,
            "message": {
                "message_id": 7,
                "chat": {"id": -100500, "type": "group"},
                "from": {"id": 42, "first_name": "Ana", "username": "anaops"},
                "forward_origin": {
                    "type": "user",
                    "date": 1754200000,
                    "sender_user": {"id": 7, "first_name": "Jane", "last_name": "Doe", "username": "jane"}
                },
                "text": "hi, let's talk pricing"
            }
        });

        let envelope = decode_update(&update).expect("decode");
        let InboundEvent::Forwarded(event) = envelope.event else {
            panic!("expected forwarded event");
        };
        assert_eq!(event.chat.0, -100500);
        assert_eq!(event.user.0, 42);
        assert_eq!(event.entry.sender_name, "Jane Doe");
        assert_eq!(event.entry.sender_username.as_deref(), Some("jane"));
        assert_eq!(event.entry.text, "hi, let's talk pricing");
    }

    #[test]
    fn decodes_hidden_forward_origin() {
        let update = json!({
            "update_id": 101,
            "message": {
                "message_id": 8,
                "chat": {"id": 5, "type": "private"},
                "from": {"id": 42, "first_name": "Ana"},
                "forward_origin": {"type": "hidden_user", "date": 1754200000, "sender_user_name": "Jane Doe"},
                "text": "hello"
            }
        });

        let envelope = decode_update(&update).expect("decode");
        let InboundEvent::Forwarded(event) = envelope.event else {
            panic!("expected forwarded event");
        };
        assert_eq!(event.entry.sender_name, "Jane Doe");
        assert!(event.entry.sender_username.is_none());
    }

    #[test]
    fn decodes_command_and_text_messages() {
        let command = json!({
            "update_id": 102,
            "message": {
                "message_id": 9,
                "chat": {"id": 5, "type": "private"},
                "from": {"id": 42, "first_name": "Ana"},
                "text": "/done create a person"
            }
        });
        let envelope = decode_update(&command).expect("decode");
        let InboundEvent::Command(event) = envelope.event else {
            panic!("expected command event");
        };
        assert_eq!(event.name, "done");
        assert_eq!(event.args, "create a person");

        let text = json!({
            "update_id": 103,
            "message": {
                "message_id": 10,
                "chat": {"id": 5, "type": "private"},
                "from": {"id": 42, "first_name": "Ana"},
                "text": "create a person"
            }
        });
        let envelope = decode_update(&text).expect("decode");
        assert!(matches!(envelope.event, InboundEvent::Text(_)));
    }

    #[test]
    fn decodes_callback_queries() {
        let update = json!({
            "update_id": 104,
            "callback_query": {
                "id": "cb-77",
                "from": {"id": 42, "first_name": "Ana"},
                "message": {"message_id": 11, "chat": {"id": -100500, "type": "group"}},
                "data": "42|confirm"
            }
        });

        let envelope = decode_update(&update).expect("decode");
        let InboundEvent::Callback(event) = envelope.event else {
            panic!("expected callback event");
        };
        assert_eq!(event.callback_id, "cb-77");
        assert_eq!(event.data, "42|confirm");
        assert_eq!(event.chat.0, -100500);
    }

    #[test]
    fn media_only_forward_is_flagged() {
        let update = json!({
            "update_id": 105,
            "message": {
                "message_id": 12,
                "chat": {"id": 5, "type": "private"},
                "from": {"id": 42, "first_name": "Ana"},
                "forward_origin": {"type": "hidden_user", "date": 1754200000, "sender_user_name": "Jane"},
                "photo": [{"file_id": "abc"}]
            }
        });

        let envelope = decode_update(&update).expect("decode");
        let InboundEvent::Forwarded(event) = envelope.event else {
            panic!("expected forwarded event");
        };
        assert!(event.entry.has_media);
        assert_eq!(event.entry.media_kind.as_deref(), Some("photo"));
        assert!(event.entry.text.is_empty());
    }

    #[test]
    fn unknown_update_kinds_are_unsupported() {
        let update = json!({"update_id": 106, "poll": {"id": "p1"}});
        let envelope = decode_update(&update).expect("decode");
        assert!(matches!(envelope.event, InboundEvent::Unsupported { ref kind } if kind == "poll"));
    }
}
