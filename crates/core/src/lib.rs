//! Conversation resolution engine: turns forwarded chat snippets and
//! free-text instructions into confirmed CRM mutations.
//!
//! The engine owns the per-(chat,user) state machine, the short-window
//! correlation of instructions with forwards, the clarification loop, the
//! fuzzy record matcher, and the composite executor. The Telegram
//! transport, CRM REST client, classifier, and session store are
//! collaborators behind narrow traits so everything here is testable with
//! in-memory fakes.

pub mod clarify;
pub mod classifier;
pub mod config;
pub mod correlator;
pub mod crm;
pub mod deadline;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod machine;
pub mod matcher;
pub mod resolver;
pub mod store;
pub mod workflow;

pub use classifier::{Classifier, ClassifierError};
pub use crm::{
    CreatedRecord, CrmError, CrmObject, RecordMutator, Registry, SearchResult, WorkspaceMember,
};
pub use domain::action::{Clarification, Intent, PrerequisiteAction, SuggestedAction};
pub use domain::ids::{ChatId, MessageId, SessionKey, UserId};
pub use domain::session::{CallerInfo, ForwardedMessageEntry, SchemaCache, Session};
pub use errors::EngineError;
pub use executor::{CompositeExecutor, ExecutionReport, RecordRef};
pub use machine::{CallbackAction, CallbackData, EngineInput, EngineReply, SessionEngine, SessionState};
pub use matcher::{match_reference, MatchConfidence, MatchConfidenceResult};
pub use store::{PendingInstruction, PendingInstructionStore, SessionStore, StoreError};
