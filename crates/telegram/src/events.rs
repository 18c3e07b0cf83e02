//! Decoded inbound events and the router that feeds them through the
//! session engine. The engine never sees raw Telegram payloads; decoding
//! lives in `api`, and this module only deals in typed events.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use dossier_core::domain::ids::{ChatId, MessageId, UserId};
use dossier_core::domain::session::{CallerInfo, ForwardedMessageEntry};
use dossier_core::errors::EngineError;
use dossier_core::machine::{EngineInput, SessionEngine};

use crate::api::{ApiError, TelegramApi};
use crate::render;

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateEnvelope {
    pub update_id: i64,
    pub event: InboundEvent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    Forwarded(ForwardedEvent),
    Text(TextEvent),
    Command(CommandEvent),
    Callback(CallbackEvent),
    Unsupported { kind: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedEvent {
    pub chat: ChatId,
    pub user: UserId,
    pub caller: CallerInfo,
    pub entry: ForwardedMessageEntry,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextEvent {
    pub chat: ChatId,
    pub user: UserId,
    pub caller: CallerInfo,
    pub message_id: MessageId,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandEvent {
    pub chat: ChatId,
    pub user: UserId,
    pub caller: CallerInfo,
    pub name: String,
    pub args: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallbackEvent {
    pub chat: ChatId,
    pub user: UserId,
    pub caller: CallerInfo,
    pub callback_id: String,
    pub data: String,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, envelope: &UpdateEnvelope) -> Result<(), RouteError>;
}

/// Routes decoded updates into the engine and renders the replies back to
/// the chat. Engine errors become user-visible guidance, never a crash of
/// the update loop.
pub struct EventRouter {
    engine: Arc<SessionEngine>,
    api: Arc<dyn TelegramApi>,
}

impl EventRouter {
    pub fn new(engine: Arc<SessionEngine>, api: Arc<dyn TelegramApi>) -> Self {
        Self { engine, api }
    }

    fn engine_input(event: &InboundEvent) -> Option<(ChatId, EngineInput)> {
        match event {
            InboundEvent::Forwarded(event) => Some((
                event.chat,
                EngineInput::Forwarded {
                    chat: event.chat,
                    user: event.user,
                    caller: event.caller.clone(),
                    entry: event.entry.clone(),
                },
            )),
            InboundEvent::Text(event) => Some((
                event.chat,
                EngineInput::Text {
                    chat: event.chat,
                    user: event.user,
                    caller: event.caller.clone(),
                    message_id: event.message_id,
                    text: event.text.clone(),
                },
            )),
            InboundEvent::Command(event) => Some((
                event.chat,
                EngineInput::Command {
                    chat: event.chat,
                    user: event.user,
                    caller: event.caller.clone(),
                    name: event.name.clone(),
                    args: event.args.clone(),
                },
            )),
            InboundEvent::Callback(event) => Some((
                event.chat,
                EngineInput::Callback {
                    chat: event.chat,
                    user: event.user,
                    caller: event.caller.clone(),
                    data: event.data.clone(),
                },
            )),
            InboundEvent::Unsupported { .. } => None,
        }
    }
}

#[async_trait]
impl UpdateHandler for EventRouter {
    async fn handle_update(&self, envelope: &UpdateEnvelope) -> Result<(), RouteError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        // Button presses get their spinner dismissed whatever happens next.
        if let InboundEvent::Callback(callback) = &envelope.event {
            if let Err(error) = self.api.answer_callback(&callback.callback_id).await {
                warn!(
                    event_name = "router.answer_callback_failed",
                    correlation_id = %correlation_id,
                    error = %error,
                    "callback acknowledgement failed"
                );
            }
        }

        let Some((chat, input)) = Self::engine_input(&envelope.event) else {
            info!(
                event_name = "router.update_ignored",
                update_id = envelope.update_id,
                correlation_id = %correlation_id,
                "unsupported update kind"
            );
            return Ok(());
        };

        match self.engine.handle(input).await {
            Ok(replies) => {
                for reply in replies {
                    let outbound = render::render_reply(&reply);
                    self.api.send_message(chat, &outbound).await?;
                }
            }
            Err(error) => {
                if matches!(error, EngineError::Store(_) | EngineError::Crm(_)) {
                    warn!(
                        event_name = "router.engine_error",
                        update_id = envelope.update_id,
                        correlation_id = %correlation_id,
                        error = %error,
                        "engine failed while handling update"
                    );
                }
                self.api
                    .send_message(chat, &render::plain_message(error.user_message()))
                    .await?;
            }
        }
        Ok(())
    }
}
