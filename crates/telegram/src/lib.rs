//! Telegram surface for the conversation engine: wire decoding, command
//! parsing, reply rendering with inline keyboards, and the long-poll
//! update runner. The engine itself never touches a raw Telegram payload.

pub mod api;
pub mod commands;
pub mod events;
pub mod poller;
pub mod render;

pub use api::{decode_update, ApiError, HttpTelegramApi, TelegramApi};
pub use events::{EventRouter, InboundEvent, RouteError, UpdateEnvelope, UpdateHandler};
pub use poller::{ReconnectPolicy, TelegramTransport, TransportError, UpdateRunner};
pub use render::{render_reply, InlineButton, InlineKeyboard, OutboundMessage};
