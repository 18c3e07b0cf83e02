//! Contract for the classifier collaborator. Both calls are pure
//! request/response: the classifier never sees session state and never
//! performs side effects visible to the engine.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::action::SuggestedAction;
use crate::domain::session::ForwardedMessageEntry;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("classifier failure: {0}")]
    Failed(String),
    #[error("classifier returned an unusable response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Turn a queued conversation plus the user's instruction into a
    /// proposed action.
    async fn analyze(
        &self,
        messages: &[ForwardedMessageEntry],
        instruction: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError>;

    /// Apply one clarification answer. The returned action's own
    /// clarification list may have grown or shrunk.
    async fn process_clarification(
        &self,
        action: &SuggestedAction,
        field: &str,
        answer: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError>;
}

/// Scripted classifier for tests: returns a fixed analysis, and applies
/// clarification answers by writing the answer into the named field and
/// dropping that field's clarification.
pub struct ScriptedClassifier {
    analysis: SuggestedAction,
}

impl ScriptedClassifier {
    pub fn new(analysis: SuggestedAction) -> Self {
        Self { analysis }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn analyze(
        &self,
        _messages: &[ForwardedMessageEntry],
        _instruction: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        Ok(self.analysis.clone())
    }

    async fn process_clarification(
        &self,
        action: &SuggestedAction,
        field: &str,
        answer: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        let mut updated = action.clone();
        updated.set_field(field, answer);
        updated.remove_clarification(field);
        Ok(updated)
    }
}
