//! Long-poll update loop. The transport yields one decoded envelope per
//! call; the runner pumps them into the handler, reconnecting with bounded
//! backoff and degrading (never crashing) when retries are exhausted.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{UpdateEnvelope, UpdateHandler};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport read failed: {0}")]
    Receive(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait TelegramTransport: Send + Sync {
    /// One decoded update, `None` when the stream has ended.
    async fn next_update(&self) -> Result<Option<UpdateEnvelope>, TransportError>;
}

pub struct UpdateRunner {
    transport: Arc<dyn TelegramTransport>,
    handler: Arc<dyn UpdateHandler>,
    reconnect_policy: ReconnectPolicy,
}

impl UpdateRunner {
    pub fn new(
        transport: Arc<dyn TelegramTransport>,
        handler: Arc<dyn UpdateHandler>,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, handler, reconnect_policy }
    }

    pub async fn start(&self) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            match self.pump().await {
                Ok(()) => {
                    info!(event_name = "ingress.telegram.stream_closed", "update stream ended");
                    return Ok(());
                }
                Err(transport_error) => {
                    warn!(
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "telegram transport failed"
                    );
                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            max_retries = self.reconnect_policy.max_retries,
                            "update retries exhausted; continuing process without crash"
                        );
                        return Ok(());
                    }
                    let delay = self.reconnect_policy.backoff(attempt);
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn pump(&self) -> Result<(), TransportError> {
        loop {
            let Some(envelope) = self.transport.next_update().await? else {
                return Ok(());
            };

            info!(
                event_name = "ingress.telegram.update_received",
                update_id = envelope.update_id,
                "received telegram update"
            );

            if let Err(error) = self.handler.handle_update(&envelope).await {
                warn!(
                    update_id = envelope.update_id,
                    error = %error,
                    "update handling failed; continuing poll loop"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{ReconnectPolicy, TelegramTransport, TransportError, UpdateRunner};
    use crate::events::{InboundEvent, RouteError, UpdateEnvelope, UpdateHandler};

    struct ScriptedTransport {
        updates: Mutex<VecDeque<Result<Option<UpdateEnvelope>, TransportError>>>,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<Option<UpdateEnvelope>, TransportError>>) -> Self {
            Self { updates: Mutex::new(script.into()) }
        }
    }

    #[async_trait]
    impl TelegramTransport for ScriptedTransport {
        async fn next_update(&self) -> Result<Option<UpdateEnvelope>, TransportError> {
            self.updates.lock().await.pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl UpdateHandler for CountingHandler {
        async fn handle_update(&self, envelope: &UpdateEnvelope) -> Result<(), RouteError> {
            self.handled.lock().await.push(envelope.update_id);
            Ok(())
        }
    }

    fn envelope(update_id: i64) -> UpdateEnvelope {
        UpdateEnvelope {
            update_id,
            event: InboundEvent::Unsupported { kind: "test".to_owned() },
        }
    }

    #[tokio::test]
    async fn pumps_updates_until_stream_end() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Ok(Some(envelope(1))),
            Ok(Some(envelope(2))),
            Ok(None),
        ]));
        let handler = Arc::new(CountingHandler::default());
        let runner = UpdateRunner::new(
            transport,
            handler.clone(),
            ReconnectPolicy { max_retries: 0, base_delay_ms: 0, max_delay_ms: 0 },
        );

        runner.start().await.expect("runner");
        assert_eq!(handler.handled.lock().await.as_slice(), [1, 2]);
    }

    #[tokio::test]
    async fn reconnects_after_transient_receive_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(TransportError::Receive("timeout".to_owned())),
            Ok(Some(envelope(3))),
            Ok(None),
        ]));
        let handler = Arc::new(CountingHandler::default());
        let runner = UpdateRunner::new(
            transport,
            handler.clone(),
            ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 },
        );

        runner.start().await.expect("runner");
        assert_eq!(handler.handled.lock().await.as_slice(), [3]);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(TransportError::Receive("fail-1".to_owned())),
            Err(TransportError::Receive("fail-2".to_owned())),
            Err(TransportError::Receive("fail-3".to_owned())),
        ]));
        let runner = UpdateRunner::new(
            transport,
            Arc::new(CountingHandler::default()),
            ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 },
        );

        runner.start().await.expect("runner degrades gracefully");
    }
}
