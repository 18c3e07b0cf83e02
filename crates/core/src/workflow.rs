//! Helpers for the externally-hosted-workflow deployment variant, where a
//! long-lived conversation engine runs behind a hook that may lag the first
//! webhook delivery. Resume failures are user-facing, never fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::ids::ChatId;
use crate::errors::EngineError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("workflow hook not registered")]
    NotRegistered,
    #[error("workflow signal failed: {0}")]
    Signal(String),
}

/// Contract for the external workflow host.
#[async_trait]
pub trait WorkflowHook: Send + Sync {
    async fn attach_event(
        &self,
        chat: ChatId,
        payload: &serde_json::Value,
    ) -> Result<(), WorkflowError>;
    async fn terminate(&self, chat: ChatId) -> Result<(), WorkflowError>;
    async fn force_cancel(&self, chat: ChatId) -> Result<(), WorkflowError>;
    async fn start(&self, chat: ChatId) -> Result<(), WorkflowError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Pause after terminate/cancel signals so the host settles before the
    /// next start.
    pub settle: Duration,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_millis(300), settle: Duration::from_millis(150) }
    }
}

/// Attach an event to the chat's workflow, tolerating registration lag:
/// fixed backoff between attempts, bounded, then downgraded to a
/// user-visible restart request.
pub async fn attach_with_retry(
    hook: &Arc<dyn WorkflowHook>,
    chat: ChatId,
    payload: &serde_json::Value,
    policy: &ResumePolicy,
) -> Result<(), EngineError> {
    for attempt in 1..=policy.max_attempts {
        match hook.attach_event(chat, payload).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                warn!(
                    event_name = "workflow.attach_failed",
                    chat = %chat,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "event attach failed"
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
    Err(EngineError::ResumeRace)
}

/// Start a fresh workflow for a chat that may already have one running:
/// graceful terminate first, force-cancel as fallback, each followed by a
/// settle delay, so two engines never run concurrently for one chat.
pub async fn restart(
    hook: &Arc<dyn WorkflowHook>,
    chat: ChatId,
    policy: &ResumePolicy,
) -> Result<(), WorkflowError> {
    match hook.terminate(chat).await {
        Ok(()) => {
            tokio::time::sleep(policy.settle).await;
        }
        Err(error) => {
            warn!(
                event_name = "workflow.terminate_failed",
                chat = %chat,
                error = %error,
                "graceful terminate failed, forcing cancel"
            );
            hook.force_cancel(chat).await?;
            tokio::time::sleep(policy.settle).await;
        }
    }

    info!(event_name = "workflow.restarted", chat = %chat, "starting fresh workflow run");
    hook.start(chat).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{attach_with_retry, restart, ResumePolicy, WorkflowError, WorkflowHook};
    use crate::domain::ids::ChatId;
    use crate::errors::EngineError;

    #[derive(Default)]
    struct ScriptedHook {
        attach_failures_before_success: u32,
        attach_calls: AtomicU32,
        terminate_fails: bool,
        terminate_calls: AtomicU32,
        force_cancel_calls: AtomicU32,
        start_calls: AtomicU32,
    }

    #[async_trait]
    impl WorkflowHook for ScriptedHook {
        async fn attach_event(
            &self,
            _chat: ChatId,
            _payload: &serde_json::Value,
        ) -> Result<(), WorkflowError> {
            let attempt = self.attach_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.attach_failures_before_success {
                Err(WorkflowError::NotRegistered)
            } else {
                Ok(())
            }
        }

        async fn terminate(&self, _chat: ChatId) -> Result<(), WorkflowError> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            if self.terminate_fails {
                Err(WorkflowError::Signal("no active run".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn force_cancel(&self, _chat: ChatId) -> Result<(), WorkflowError> {
            self.force_cancel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self, _chat: ChatId) -> Result<(), WorkflowError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy() -> ResumePolicy {
        ResumePolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(0),
            settle: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn attach_succeeds_after_transient_registration_lag() {
        let hook: Arc<dyn WorkflowHook> =
            Arc::new(ScriptedHook { attach_failures_before_success: 2, ..Default::default() });

        let result =
            attach_with_retry(&hook, ChatId(1), &serde_json::json!({}), &fast_policy()).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn attach_gives_up_after_bounded_attempts() {
        let scripted =
            Arc::new(ScriptedHook { attach_failures_before_success: 10, ..Default::default() });
        let hook: Arc<dyn WorkflowHook> = scripted.clone();

        let result =
            attach_with_retry(&hook, ChatId(1), &serde_json::json!({}), &fast_policy()).await;

        assert_eq!(result, Err(EngineError::ResumeRace));
        assert_eq!(scripted.attach_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn restart_prefers_graceful_terminate() {
        let scripted = Arc::new(ScriptedHook::default());
        let hook: Arc<dyn WorkflowHook> = scripted.clone();

        restart(&hook, ChatId(1), &fast_policy()).await.expect("restart");

        assert_eq!(scripted.terminate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scripted.force_cancel_calls.load(Ordering::SeqCst), 0);
        assert_eq!(scripted.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_falls_back_to_force_cancel() {
        let scripted = Arc::new(ScriptedHook { terminate_fails: true, ..Default::default() });
        let hook: Arc<dyn WorkflowHook> = scripted.clone();

        restart(&hook, ChatId(1), &fast_policy()).await.expect("restart");

        assert_eq!(scripted.terminate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scripted.force_cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scripted.start_calls.load(Ordering::SeqCst), 1);
    }
}
