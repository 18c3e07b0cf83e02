//! Pairs a free-text instruction with the forwarded-message burst that
//! follows it inside the 2-second correlation window.
//!
//! This is a best-effort heuristic, not a guarantee: Telegram delivery
//! ordering is not guaranteed, so an instruction whose window lapses before
//! the forward arrives is simply lost as a correlation target. It stays
//! usable through an explicit `/done <instruction>` command.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::ids::{ChatId, MessageId};
use crate::domain::session::CallerInfo;
use crate::store::{PendingInstruction, PendingInstructionStore, StoreError};

pub struct Correlator {
    pending: Arc<dyn PendingInstructionStore>,
}

impl Correlator {
    pub fn new(pending: Arc<dyn PendingInstructionStore>) -> Self {
        Self { pending }
    }

    /// Record a free-text instruction as a correlation target for this chat.
    /// Overwrites any previous pending instruction for the same chat.
    pub async fn note_instruction(
        &self,
        chat: ChatId,
        text: &str,
        message_id: MessageId,
        caller: CallerInfo,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug!(event_name = "correlator.instruction_noted", chat = %chat, "pending instruction stored");
        self.pending
            .put(
                chat,
                PendingInstruction {
                    text: text.to_owned(),
                    message_id,
                    caller,
                    created_at: now,
                },
            )
            .await
    }

    /// Claim the live pending instruction for this chat, if any. The read
    /// is an atomic read-and-delete so a burst of forwards consumes the
    /// instruction exactly once.
    pub async fn claim_for_forward(
        &self,
        chat: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingInstruction>, StoreError> {
        let claimed = self.pending.take_live(chat, now).await?;
        if claimed.is_some() {
            debug!(event_name = "correlator.instruction_claimed", chat = %chat, "instruction paired with forward");
        }
        Ok(claimed)
    }
}
