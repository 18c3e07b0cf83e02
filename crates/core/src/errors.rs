use thiserror::Error;

use crate::classifier::ClassifierError;
use crate::crm::CrmError;
use crate::store::StoreError;

/// Failure taxonomy for the conversation engine. Every collaborator error
/// is caught at a component boundary and converted into one of these; no
/// raw transport error reaches the user.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// State or action missing when an interaction requires it.
    /// Recoverable by restarting, never retried automatically.
    #[error("session expired")]
    ExpiredSession,
    /// A user other than the initiating user tried to drive the action.
    #[error("action is owned by another user")]
    OwnershipViolation,
    /// A prerequisite creation failed; the composite operation aborted
    /// before the main action.
    #[error("prerequisite {label} failed: {message}")]
    Prerequisite { label: String, message: String },
    /// Attaching an event to an externally-hosted workflow kept failing
    /// after bounded retries.
    #[error("could not resume the active conversation")]
    ResumeRace,
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// What the chat user sees. Prerequisite failures carry the
    /// collaborator's own message verbatim; infrastructure failures are
    /// flattened to safe guidance.
    pub fn user_message(&self) -> String {
        match self {
            Self::ExpiredSession => {
                "This session has expired. Send /start to begin again.".to_owned()
            }
            Self::OwnershipViolation => {
                "Only the user who started this action can respond to it.".to_owned()
            }
            Self::Prerequisite { label, message } => {
                format!("Could not create the {label} this action depends on: {message}")
            }
            Self::ResumeRace => {
                "I lost track of this conversation. Please start over with /start.".to_owned()
            }
            Self::Classifier(_) => "I couldn't analyze that message. Please try again.".to_owned(),
            Self::Crm(error) => format!("The CRM request failed: {error}"),
            Self::Store(_) => {
                "Something went wrong saving this conversation. Please try again.".to_owned()
            }
        }
    }
}
