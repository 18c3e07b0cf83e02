//! Per-session event handling. Every inbound event is routed through the
//! active state's handler; each handler performs a full read-modify-write
//! of the session so no partial update is ever visible to a concurrent
//! reader. Sessions are single-writer resources (see the store contract).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::clarify::{self, ClarifyOutcome, FREE_TEXT_SENTINEL};
use crate::correlator::Correlator;
use crate::crm::{CrmObject, Registry, RecordMutator, SearchResult, WorkspaceMember};
use crate::domain::action::{Clarification, Intent, SuggestedAction};
use crate::domain::ids::{ChatId, MessageId, SessionKey, UserId};
use crate::domain::session::{CallerInfo, ForwardedMessageEntry, SchemaCache, Session};
use crate::errors::EngineError;
use crate::executor::{CompositeExecutor, ExecutionReport};
use crate::machine::states::{
    CallbackAction, CallbackData, SessionState, ASSIGNEE_PAGE_SIZE,
};
use crate::resolver::{self, TARGET_TYPE_FIELD};
use crate::store::{PendingInstructionStore, SessionStore};

/// One decoded inbound event, as delivered by the transport.
#[derive(Clone, Debug)]
pub enum EngineInput {
    Forwarded {
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        entry: ForwardedMessageEntry,
    },
    Text {
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        message_id: MessageId,
        text: String,
    },
    Command {
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        name: String,
        args: String,
    },
    Callback {
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        data: String,
    },
}

/// Semantic reply to render back into the chat. The UI layer maps these to
/// message text and inline keyboards.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineReply {
    Text(String),
    /// Proposed action summary with confirm/edit/cancel controls.
    Summary { action: SuggestedAction, owner: UserId, queued: usize },
    /// One clarification question, with option buttons when present.
    Question { clarification: Clarification, owner: UserId },
    /// Pick-one list (note-parent candidates).
    Selection { prompt: String, options: Vec<String>, owner: UserId },
    /// One page of the workspace-member picker.
    AssigneePage { page: usize, members: Vec<WorkspaceMember>, owner: UserId },
    /// List / Company / Person choice for a note parent.
    NoteParentPrompt { owner: UserId },
    Report(ExecutionReport),
    /// Execution failed; the action stays pending for retry.
    Failure { message: String },
}

pub struct SessionEngine {
    sessions: Arc<dyn SessionStore>,
    correlator: Correlator,
    classifier: Arc<dyn Classifier>,
    registry: Arc<dyn Registry>,
    executor: CompositeExecutor,
}

impl SessionEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        pending: Arc<dyn PendingInstructionStore>,
        classifier: Arc<dyn Classifier>,
        registry: Arc<dyn Registry>,
        mutator: Arc<dyn RecordMutator>,
    ) -> Self {
        Self {
            sessions,
            correlator: Correlator::new(pending),
            classifier,
            registry: registry.clone(),
            executor: CompositeExecutor::new(registry, mutator),
        }
    }

    pub async fn handle(&self, input: EngineInput) -> Result<Vec<EngineReply>, EngineError> {
        match input {
            EngineInput::Forwarded { chat, user, caller, entry } => {
                self.on_forwarded(chat, user, caller, entry).await
            }
            EngineInput::Text { chat, user, caller, message_id, text } => {
                self.on_text(chat, user, caller, message_id, text).await
            }
            EngineInput::Command { chat, user, caller, name, args } => {
                self.on_command(chat, user, caller, &name, &args).await
            }
            EngineInput::Callback { chat, user, data, .. } => {
                self.on_callback(chat, user, &data).await
            }
        }
    }

    async fn load_or_create(
        &self,
        chat: ChatId,
        user: UserId,
        caller: &CallerInfo,
        now: DateTime<Utc>,
    ) -> Result<Session, EngineError> {
        let key = SessionKey::new(chat, user);
        match self.sessions.load(&key).await? {
            Some(session) => Ok(session),
            None => Ok(Session::new(chat, user, caller.clone(), now)),
        }
    }

    /// A forwarded message always appends to the queue, whatever the state;
    /// only `Idle`/`GatheringMessages` move to `GatheringMessages` and are
    /// eligible for instruction correlation.
    async fn on_forwarded(
        &self,
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        entry: ForwardedMessageEntry,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let mut session = self.load_or_create(chat, user, &caller, now).await?;
        session.message_queue.push(entry);
        session.touch(now);

        if !session.state.accepts_instruction() {
            self.sessions.save(&session).await?;
            return Ok(Vec::new());
        }
        session.state = SessionState::GatheringMessages;

        if let Some(pending) = self.correlator.claim_for_forward(chat, now).await? {
            info!(
                event_name = "engine.forward_combined",
                chat = %chat,
                "forward combined with pending instruction"
            );
            return self.analyze_and_stage(session, pending.text).await;
        }

        let queued = session.message_queue.len();
        self.sessions.save(&session).await?;
        Ok(vec![EngineReply::Text(format!(
            "Queued ({queued} message{}). Forward more, or send /done <instruction> to process.",
            if queued == 1 { "" } else { "s" }
        ))])
    }

    async fn on_text(
        &self,
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        message_id: MessageId,
        text: String,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let mut session = self.load_or_create(chat, user, &caller, now).await?;

        match session.state.clone() {
            SessionState::Idle | SessionState::GatheringMessages => {
                // Correlation target for a forward that may follow within
                // the 2-second window. No reply; if nothing follows the
                // text was probably chat noise.
                self.correlator
                    .note_instruction(chat, &text, message_id, caller, now)
                    .await?;
                self.sessions.save(&session).await?;
                Ok(Vec::new())
            }
            SessionState::AwaitingClarification { index, questions } => {
                self.require_owner(&session, user)?;
                self.apply_clarification_answer(session, index, &questions, &text).await
            }
            SessionState::AwaitingEdit { field, .. } => {
                self.require_owner(&session, user)?;
                let Some(action) = session.current_action.as_mut() else {
                    return Err(EngineError::ExpiredSession);
                };
                action.set_field(&field, text.trim());
                action.remove_clarification(&field);
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
            SessionState::AwaitingAssigneeInput => {
                self.require_owner(&session, user)?;
                let Some(action) = session.current_action.as_mut() else {
                    return Err(EngineError::ExpiredSession);
                };
                action.set_field("assignee", text.trim());
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
            SessionState::AwaitingNoteParentSearch { parent_type } => {
                self.require_owner(&session, user)?;
                let results = self.registry.search_records(parent_type, text.trim()).await?;
                if results.is_empty() {
                    return Ok(vec![EngineReply::Text(format!(
                        "No {} found matching \"{}\". Try another name, or /cancel.",
                        parent_type.singular(),
                        text.trim()
                    ))]);
                }
                let shortlist: Vec<SearchResult> =
                    results.into_iter().take(resolver::SELECTION_LIMIT).collect();
                let options = shortlist.iter().map(|result| result.name.clone()).collect();
                let owner = session.initiating_user;
                session.state =
                    SessionState::AwaitingNoteParentSelection { parent_type, results: shortlist };
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Selection {
                    prompt: format!("Which {} should the note go on?", parent_type.singular()),
                    options,
                    owner,
                }])
            }
            SessionState::AwaitingConfirmation => Ok(vec![EngineReply::Text(
                "Use the buttons to confirm, edit, or cancel the pending action.".to_owned(),
            )]),
            SessionState::AwaitingAssignee { .. }
            | SessionState::AwaitingNoteParentType
            | SessionState::AwaitingNoteParentSelection { .. } => {
                Ok(vec![EngineReply::Text("Please pick one of the offered options.".to_owned())])
            }
            SessionState::Executing => {
                Ok(vec![EngineReply::Text("Still working on the previous action…".to_owned())])
            }
        }
    }

    async fn on_command(
        &self,
        chat: ChatId,
        user: UserId,
        caller: CallerInfo,
        name: &str,
        args: &str,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let mut session = self.load_or_create(chat, user, &caller, now).await?;

        match name {
            "start" => {
                session.reset(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(
                    "Forward me a conversation, then tell me what to do with it \
                     (for example: /done create a person)."
                        .to_owned(),
                )])
            }
            "cancel" => {
                session.reset(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(
                    "Cancelled. The queued messages and pending action were discarded.".to_owned(),
                )])
            }
            "done" => {
                if session.message_queue.is_empty() {
                    return Ok(vec![EngineReply::Text(
                        "Nothing is queued yet — forward a conversation first.".to_owned(),
                    )]);
                }
                let instruction = if args.trim().is_empty() {
                    session
                        .current_instruction
                        .clone()
                        .unwrap_or_else(|| "file this conversation".to_owned())
                } else {
                    args.trim().to_owned()
                };
                self.analyze_and_stage(session, instruction).await
            }
            _ => Ok(vec![EngineReply::Text(
                "Commands: /start, /done <instruction>, /cancel.".to_owned(),
            )]),
        }
    }

    async fn on_callback(
        &self,
        chat: ChatId,
        user: UserId,
        data: &str,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let Some(callback) = CallbackData::parse(data) else {
            return Ok(vec![EngineReply::Text("This button is no longer valid.".to_owned())]);
        };

        // The keyboard belongs to the owner's session; load that one, then
        // reject any other user before touching state.
        let key = SessionKey::new(chat, callback.owner);
        let Some(mut session) = self.sessions.load(&key).await? else {
            return Err(EngineError::ExpiredSession);
        };
        if user != callback.owner {
            warn!(
                event_name = "engine.ownership_rejected",
                chat = %chat,
                owner = %callback.owner,
                user = %user,
                "button press by non-owner"
            );
            return Err(EngineError::OwnershipViolation);
        }

        match (callback.action, session.state.clone()) {
            (CallbackAction::Cancel, _) => {
                session.reset(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(
                    "Cancelled. The queued messages and pending action were discarded.".to_owned(),
                )])
            }
            (CallbackAction::Confirm, SessionState::AwaitingConfirmation) => {
                self.on_confirm(session, now).await
            }
            (CallbackAction::Edit { field }, SessionState::AwaitingConfirmation) => {
                let Some(action) = session.current_action.as_ref() else {
                    return Err(EngineError::ExpiredSession);
                };
                let original_value = action.field(&field).map(str::to_owned);
                let prompt = match &original_value {
                    Some(value) => format!("Send a new value for {field} (currently: {value})."),
                    None => format!("Send a value for {field}."),
                };
                session.state = SessionState::AwaitingEdit { field, original_value };
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(prompt)])
            }
            (
                CallbackAction::ClarifyOption { value },
                SessionState::AwaitingClarification { index, questions },
            ) => {
                if value == FREE_TEXT_SENTINEL {
                    // State deliberately unchanged: the next text message
                    // answers the same question.
                    return Ok(vec![EngineReply::Text(
                        "Type your answer as a message.".to_owned(),
                    )]);
                }
                self.apply_clarification_answer(session, index, &questions, &value).await
            }
            (CallbackAction::ClarifyFreeText, SessionState::AwaitingClarification { .. }) => {
                // State deliberately unchanged: the next text message
                // answers the current question.
                Ok(vec![EngineReply::Text("Type your answer as a message.".to_owned())])
            }
            (CallbackAction::ClarifySkip, SessionState::AwaitingClarification { .. }) => {
                let Some(action) = session.current_action.as_mut() else {
                    return Err(EngineError::ExpiredSession);
                };
                clarify::skip_remaining(action);
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
            (CallbackAction::NoteParent { object }, SessionState::AwaitingNoteParentType) => {
                session.state = SessionState::AwaitingNoteParentSearch { parent_type: object };
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(format!(
                    "Send a name to search {} for the note's parent.",
                    object.as_str()
                ))])
            }
            (
                CallbackAction::SelectOption { index },
                SessionState::AwaitingNoteParentSelection { parent_type, results },
            ) => {
                let Some(picked) = results.get(index) else {
                    return Ok(vec![EngineReply::Text(
                        "Please pick one of the offered options.".to_owned(),
                    )]);
                };
                let Some(action) = session.current_action.as_mut() else {
                    return Err(EngineError::ExpiredSession);
                };
                action.set_parent(parent_type, picked.id.clone());
                action.set_field("target_name", picked.name.clone());
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
            (
                CallbackAction::AssigneePage { page },
                SessionState::AwaitingAssignee { members, .. },
            ) => {
                let last_page = members.len().saturating_sub(1) / ASSIGNEE_PAGE_SIZE;
                let page = page.min(last_page);
                let owner = session.initiating_user;
                session.state = SessionState::AwaitingAssignee { page, members: members.clone() };
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::AssigneePage { page, members, owner }])
            }
            (
                CallbackAction::AssigneePick { index },
                SessionState::AwaitingAssignee { members, .. },
            ) => {
                let Some(member) = members.get(index) else {
                    return Ok(vec![EngineReply::Text(
                        "Please pick one of the offered options.".to_owned(),
                    )]);
                };
                let Some(action) = session.current_action.as_mut() else {
                    return Err(EngineError::ExpiredSession);
                };
                action.set_field("assignee_id", member.id.clone());
                action.set_field("assignee", member.name.clone());
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
            (CallbackAction::AssigneeManual, SessionState::AwaitingAssignee { .. }) => {
                session.state = SessionState::AwaitingAssigneeInput;
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Text(
                    "Type the assignee's name or email address.".to_owned(),
                )])
            }
            // A button that does not belong to the current state: tell the
            // user to restart rather than guessing intent.
            _ => Err(EngineError::ExpiredSession),
        }
    }

    async fn on_confirm(
        &self,
        mut session: Session,
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let Some(action) = session.current_action.clone() else {
            return Err(EngineError::ExpiredSession);
        };

        // Gates that must close before execution can start.
        if action.intent == Intent::CreateTask && action.assignee().is_none() {
            let members = self.registry.list_workspace_members().await?;
            let owner = session.initiating_user;
            if members.is_empty() {
                session.state = SessionState::AwaitingAssigneeInput;
                session.touch(now);
                self.sessions.save(&session).await?;
                return Ok(vec![EngineReply::Text(
                    "Who should this task be assigned to?".to_owned(),
                )]);
            }
            session.state = SessionState::AwaitingAssignee { page: 0, members: members.clone() };
            session.touch(now);
            self.sessions.save(&session).await?;
            return Ok(vec![EngineReply::AssigneePage { page: 0, members, owner }]);
        }
        if action.intent == Intent::AddNote && action.parent_id().is_none() {
            let owner = session.initiating_user;
            session.state = SessionState::AwaitingNoteParentType;
            session.touch(now);
            self.sessions.save(&session).await?;
            return Ok(vec![EngineReply::NoteParentPrompt { owner }]);
        }

        session.state = SessionState::Executing;
        session.touch(now);
        self.sessions.save(&session).await?;

        let outcome = self
            .executor
            .execute(
                &action,
                session.current_instruction.as_deref(),
                &session.message_queue,
                now.date_naive(),
            )
            .await;

        match outcome {
            Ok(report) => {
                session.reset(Utc::now());
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Report(report)])
            }
            Err(error) => {
                // Failure-with-retry: back to confirmation with the action
                // intact so the user can adjust or retry.
                session.state = SessionState::AwaitingConfirmation;
                session.touch(Utc::now());
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Failure { message: error.user_message() }, summary])
            }
        }
    }

    /// Apply one clarification answer. Target-type and selection answers
    /// are deterministic; everything else goes through the classifier.
    async fn apply_clarification_answer(
        &self,
        mut session: Session,
        index: usize,
        questions: &[Clarification],
        answer: &str,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let Some(question) = clarify::current_question(questions, index) else {
            return Err(EngineError::ExpiredSession);
        };
        let field = question.field.clone();
        let Some(mut action) = session.current_action.take() else {
            return Err(EngineError::ExpiredSession);
        };

        if field == TARGET_TYPE_FIELD {
            resolver::resolve_target_type(self.registry.as_ref(), &mut action, answer).await?;
            // The resolver staged a fresh question (selection or full-name
            // retry); restart the loop over the new snapshot.
            let snapshot = action.clarifications_needed.clone();
            session.current_action = Some(action);
            return self.stage_questions(session, snapshot, now).await;
        }

        if field.ends_with("_selection") {
            if resolver::apply_target_selection(&mut action, &field, answer).is_none() {
                session.current_action = Some(action);
                self.sessions.save(&session).await?;
                return Ok(vec![EngineReply::Text(
                    "Please pick one of the offered options.".to_owned(),
                )]);
            }
            return self.continue_loop(session, action, questions, index, now).await;
        }

        let schema = self.fresh_schema(&session, now);
        let updated = self
            .classifier
            .process_clarification(&action, &field, answer, schema.as_ref())
            .await?;
        self.continue_loop(session, updated, questions, index, now).await
    }

    async fn continue_loop(
        &self,
        mut session: Session,
        action: SuggestedAction,
        questions: &[Clarification],
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineReply>, EngineError> {
        match clarify::next_step(&action, questions, index) {
            ClarifyOutcome::AskNext { next_index } => {
                let owner = session.initiating_user;
                let next = questions[next_index].clone();
                session.current_action = Some(action);
                session.state = SessionState::AwaitingClarification {
                    index: next_index,
                    questions: questions.to_vec(),
                };
                session.touch(now);
                self.sessions.save(&session).await?;
                Ok(vec![EngineReply::Question { clarification: next, owner }])
            }
            ClarifyOutcome::Confirm => {
                session.current_action = Some(action);
                session.state = SessionState::AwaitingConfirmation;
                session.touch(now);
                let summary = self.summary(&session);
                self.sessions.save(&session).await?;
                Ok(vec![summary])
            }
        }
    }

    async fn analyze_and_stage(
        &self,
        mut session: Session,
        instruction: String,
    ) -> Result<Vec<EngineReply>, EngineError> {
        let now = Utc::now();
        let schema = self.ensure_schema(&mut session, now).await;
        let mut action = self
            .classifier
            .analyze(&session.message_queue, &instruction, schema.as_ref())
            .await?;
        resolver::enforce_target_type(&instruction, &mut action);
        session.current_instruction = Some(instruction);

        let snapshot = action.clarifications_needed.clone();
        session.current_action = Some(action);
        self.stage_questions(session, snapshot, now).await
    }

    /// Stage a clarification snapshot, or fall through to confirmation when
    /// there is nothing to ask.
    async fn stage_questions(
        &self,
        mut session: Session,
        snapshot: Vec<Clarification>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineReply>, EngineError> {
        if let Some(first) = snapshot.first().cloned() {
            let owner = session.initiating_user;
            session.state = SessionState::AwaitingClarification { index: 0, questions: snapshot };
            session.touch(now);
            self.sessions.save(&session).await?;
            Ok(vec![EngineReply::Question { clarification: first, owner }])
        } else {
            session.state = SessionState::AwaitingConfirmation;
            session.touch(now);
            let summary = self.summary(&session);
            self.sessions.save(&session).await?;
            Ok(vec![summary])
        }
    }

    fn summary(&self, session: &Session) -> EngineReply {
        EngineReply::Summary {
            action: session.current_action.clone().unwrap_or_else(|| {
                SuggestedAction::new(Intent::Unknown)
            }),
            owner: session.initiating_user,
            queued: session.message_queue.len(),
        }
    }

    fn require_owner(&self, session: &Session, user: UserId) -> Result<(), EngineError> {
        if session.is_owner(user) {
            Ok(())
        } else {
            Err(EngineError::OwnershipViolation)
        }
    }

    fn fresh_schema(&self, session: &Session, now: DateTime<Utc>) -> Option<Value> {
        session
            .schema_cache
            .as_ref()
            .filter(|cache| cache.is_fresh(now))
            .map(|cache| cache.attributes.clone())
    }

    /// Fetch the workspace schema unless a fresh cached copy exists. A
    /// fetch failure falls back to whatever is cached, stale or not:
    /// analysis quality degrades, the conversation does not.
    async fn ensure_schema(&self, session: &mut Session, now: DateTime<Utc>) -> Option<Value> {
        if let Some(fresh) = self.fresh_schema(session, now) {
            return Some(fresh);
        }

        let mut map = serde_json::Map::new();
        for object in
            [CrmObject::Companies, CrmObject::People, CrmObject::Deals, CrmObject::Tasks]
        {
            match self.registry.object_schema(object).await {
                Ok(value) => {
                    map.insert(object.as_str().to_owned(), value);
                }
                Err(error) => {
                    warn!(
                        event_name = "engine.schema_fetch_failed",
                        object = %object,
                        error = %error,
                        "schema fetch failed, using cached copy if any"
                    );
                    return session.schema_cache.as_ref().map(|cache| cache.attributes.clone());
                }
            }
        }

        let value = Value::Object(map);
        session.schema_cache = Some(SchemaCache::new(value.clone(), now));
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::{EngineInput, EngineReply, SessionEngine};
    use crate::classifier::{Classifier, ScriptedClassifier};
    use crate::crm::{CrmObject, InMemoryCrm, SearchResult};
    use crate::domain::action::{Clarification, Intent, SuggestedAction};
    use crate::domain::ids::{ChatId, MessageId, SessionKey, UserId};
    use crate::domain::session::{CallerInfo, ForwardedMessageEntry, Session};
    use crate::errors::EngineError;
    use crate::machine::states::{CallbackAction, CallbackData, SessionState};
    use crate::store::{
        PendingInstruction, PendingInstructionStore, SessionStore, StoreError,
    };

    #[derive(Default)]
    struct MemorySessions {
        sessions: RwLock<HashMap<String, Session>>,
    }

    #[async_trait]
    impl SessionStore for MemorySessions {
        async fn load(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
            Ok(self.sessions.read().await.get(&key.storage_key()).cloned())
        }

        async fn save(&self, session: &Session) -> Result<(), StoreError> {
            self.sessions
                .write()
                .await
                .insert(session.key().storage_key(), session.clone());
            Ok(())
        }

        async fn remove(&self, key: &SessionKey) -> Result<(), StoreError> {
            self.sessions.write().await.remove(&key.storage_key());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryPending {
        entries: RwLock<HashMap<i64, PendingInstruction>>,
    }

    #[async_trait]
    impl PendingInstructionStore for MemoryPending {
        async fn put(&self, chat: ChatId, pending: PendingInstruction) -> Result<(), StoreError> {
            self.entries.write().await.insert(chat.0, pending);
            Ok(())
        }

        async fn take_live(
            &self,
            chat: ChatId,
            now: DateTime<Utc>,
        ) -> Result<Option<PendingInstruction>, StoreError> {
            match self.entries.write().await.remove(&chat.0) {
                Some(pending) if pending.is_live(now) => Ok(Some(pending)),
                _ => Ok(None),
            }
        }
    }

    struct Harness {
        engine: SessionEngine,
        sessions: Arc<MemorySessions>,
        crm: Arc<InMemoryCrm>,
    }

    fn harness(classifier: impl Classifier + 'static) -> Harness {
        let sessions = Arc::new(MemorySessions::default());
        let crm = Arc::new(InMemoryCrm::default());
        let engine = SessionEngine::new(
            sessions.clone(),
            Arc::new(MemoryPending::default()),
            Arc::new(classifier),
            crm.clone(),
            crm.clone(),
        );
        Harness { engine, sessions, crm }
    }

    const CHAT: ChatId = ChatId(-100);
    const OWNER: UserId = UserId(42);

    fn caller() -> CallerInfo {
        CallerInfo::new("Ana Ops", Some("anaops".to_owned()))
    }

    fn forwarded(text: &str) -> EngineInput {
        EngineInput::Forwarded {
            chat: CHAT,
            user: OWNER,
            caller: caller(),
            entry: ForwardedMessageEntry {
                text: text.to_owned(),
                sender_name: "Jane Doe".to_owned(),
                sender_username: Some("jane".to_owned()),
                origin_chat: Some("Expo Leads".to_owned()),
                forwarded_at: Utc::now(),
                has_media: false,
                media_kind: None,
            },
        }
    }

    fn command(name: &str, args: &str) -> EngineInput {
        EngineInput::Command {
            chat: CHAT,
            user: OWNER,
            caller: caller(),
            name: name.to_owned(),
            args: args.to_owned(),
        }
    }

    fn text_from(user: UserId, text: &str) -> EngineInput {
        EngineInput::Text {
            chat: CHAT,
            user,
            caller: caller(),
            message_id: MessageId(1),
            text: text.to_owned(),
        }
    }

    fn press(user: UserId, action: CallbackAction) -> EngineInput {
        EngineInput::Callback {
            chat: CHAT,
            user,
            caller: caller(),
            data: CallbackData::new(OWNER, action).encode(),
        }
    }

    async fn state_of(harness: &Harness) -> SessionState {
        harness
            .sessions
            .load(&SessionKey::new(CHAT, OWNER))
            .await
            .expect("load")
            .expect("session exists")
            .state
    }

    fn person_action_with_company_question() -> SuggestedAction {
        let mut action = SuggestedAction::new(Intent::CreatePerson);
        action.confidence = 0.9;
        action.set_field("name", "Jane Doe");
        action.upsert_clarification(Clarification::free_text(
            "company",
            "Which company is Jane Doe with?",
        ));
        action
    }

    #[tokio::test]
    async fn forward_moves_idle_to_gathering_and_queues() {
        let harness = harness(ScriptedClassifier::new(SuggestedAction::new(Intent::Unknown)));

        let replies = harness.engine.handle(forwarded("hello there")).await.expect("handle");

        assert!(matches!(replies[0], EngineReply::Text(ref text) if text.contains("Queued")));
        assert_eq!(state_of(&harness).await, SessionState::GatheringMessages);
    }

    #[tokio::test]
    async fn instruction_then_forward_is_combined_into_analysis() {
        let harness = harness(ScriptedClassifier::new(person_action_with_company_question()));

        harness.engine.handle(text_from(OWNER, "create a person")).await.expect("instruction");
        let replies = harness.engine.handle(forwarded("intro from jane")).await.expect("forward");

        // The pending instruction was claimed and analysis ran straight to
        // the first clarification question.
        assert!(matches!(replies[0], EngineReply::Question { .. }));
        assert!(matches!(
            state_of(&harness).await,
            SessionState::AwaitingClarification { index: 0, .. }
        ));
    }

    #[tokio::test]
    async fn done_without_queue_is_guidance_only() {
        let harness = harness(ScriptedClassifier::new(SuggestedAction::new(Intent::Unknown)));

        let replies = harness.engine.handle(command("done", "create a person")).await.expect("done");

        assert!(matches!(replies[0], EngineReply::Text(ref text) if text.contains("forward")));
    }

    #[tokio::test]
    async fn clarification_answer_advances_to_confirmation() {
        let harness = harness(ScriptedClassifier::new(person_action_with_company_question()));
        harness.engine.handle(forwarded("intro from jane")).await.expect("forward");
        harness.engine.handle(command("done", "create a person")).await.expect("done");

        let replies = harness.engine.handle(text_from(OWNER, "Acme")).await.expect("answer");

        match &replies[0] {
            EngineReply::Summary { action, queued, .. } => {
                assert_eq!(action.field("company"), Some("Acme"));
                assert_eq!(*queued, 1);
            }
            other => panic!("expected summary, got {other:?}"),
        }
        assert_eq!(state_of(&harness).await, SessionState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn second_user_confirm_is_rejected_without_state_change() {
        let mut ready = SuggestedAction::new(Intent::CreateCompany);
        ready.set_field("name", "Acme");
        let harness = harness(ScriptedClassifier::new(ready));
        harness.engine.handle(forwarded("intro")).await.expect("forward");
        harness.engine.handle(command("done", "create the company")).await.expect("done");
        assert_eq!(state_of(&harness).await, SessionState::AwaitingConfirmation);

        let error = harness
            .engine
            .handle(press(UserId(77), CallbackAction::Confirm))
            .await
            .expect_err("non-owner must be rejected");

        assert_eq!(error, EngineError::OwnershipViolation);
        assert_eq!(state_of(&harness).await, SessionState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn stale_confirm_reports_expired_session() {
        let harness = harness(ScriptedClassifier::new(SuggestedAction::new(Intent::Unknown)));

        let error = harness
            .engine
            .handle(press(OWNER, CallbackAction::Confirm))
            .await
            .expect_err("no session yet");

        assert_eq!(error, EngineError::ExpiredSession);
    }

    #[tokio::test]
    async fn cancel_resets_but_keeps_schema_cache() {
        let mut ready = SuggestedAction::new(Intent::CreateCompany);
        ready.set_field("name", "Acme");
        let harness = harness(ScriptedClassifier::new(ready));
        harness.engine.handle(forwarded("intro")).await.expect("forward");
        harness.engine.handle(command("done", "create the company")).await.expect("done");

        harness.engine.handle(press(OWNER, CallbackAction::Cancel)).await.expect("cancel");

        let session = harness
            .sessions
            .load(&SessionKey::new(CHAT, OWNER))
            .await
            .expect("load")
            .expect("session");
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.message_queue.is_empty());
        assert!(session.current_action.is_none());
        // Schema was fetched during analysis and survives the reset.
        assert!(session.schema_cache.is_some());
    }

    #[tokio::test]
    async fn execution_failure_returns_to_confirmation_for_retry() {
        let mut ready = SuggestedAction::new(Intent::CreateCompany);
        ready.set_field("name", "Acme");
        let harness = harness(ScriptedClassifier::new(ready));
        harness.crm.fail_create(CrmObject::Companies, "workspace is read-only").await;
        harness.engine.handle(forwarded("intro")).await.expect("forward");
        harness.engine.handle(command("done", "create the company")).await.expect("done");

        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("confirm");

        assert!(matches!(
            &replies[0],
            EngineReply::Failure { message } if message.contains("workspace is read-only")
        ));
        assert_eq!(state_of(&harness).await, SessionState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn add_note_confirm_walks_parent_resolution() {
        let harness = harness(ScriptedClassifier::new(SuggestedAction::new(Intent::AddNote)));
        harness
            .crm
            .seed_search(
                CrmObject::Companies,
                "northwind",
                vec![SearchResult::new("company_7", "Northwind")],
            )
            .await;
        harness.engine.handle(forwarded("meeting notes")).await.expect("forward");
        harness.engine.handle(command("done", "attach this")).await.expect("done");

        // Confirm with no resolved parent asks for the parent type first.
        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("confirm");
        assert!(matches!(replies[0], EngineReply::NoteParentPrompt { .. }));

        harness
            .engine
            .handle(press(OWNER, CallbackAction::NoteParent { object: CrmObject::Companies }))
            .await
            .expect("pick type");
        let replies = harness.engine.handle(text_from(OWNER, "Northwind")).await.expect("search");
        assert!(matches!(replies[0], EngineReply::Selection { .. }));

        let replies = harness
            .engine
            .handle(press(OWNER, CallbackAction::SelectOption { index: 0 }))
            .await
            .expect("select");
        assert!(matches!(replies[0], EngineReply::Summary { .. }));

        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("execute");
        match &replies[0] {
            EngineReply::Report(report) => {
                assert_eq!(report.primary.id, "company_7");
                assert!(report.note_id.is_some());
            }
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_to_end_person_with_resolved_company_and_note() {
        // Forward from Jane Doe, /done create a person, answer the company
        // clarification, confirm: person created, company linked, note
        // attached with the forwarded text.
        let harness = harness(ScriptedClassifier::new(person_action_with_company_question()));
        harness
            .crm
            .seed_search(
                CrmObject::Companies,
                "acme",
                vec![SearchResult::new("company_1", "Acme")],
            )
            .await;

        harness.engine.handle(forwarded("hi, this is jane from acme")).await.expect("forward");
        let replies =
            harness.engine.handle(command("done", "create a person")).await.expect("done");
        assert!(matches!(replies[0], EngineReply::Question { .. }));

        harness.engine.handle(text_from(OWNER, "Acme")).await.expect("answer");
        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("confirm");

        let report = match &replies[0] {
            EngineReply::Report(report) => report,
            other => panic!("expected report, got {other:?}"),
        };
        assert_eq!(report.intent, Intent::CreatePerson);

        let created = harness.crm.created_records().await;
        assert_eq!(created.len(), 1, "existing company must be reused, not recreated");
        assert_eq!(created[0].0, CrmObject::People);
        assert_eq!(created[0].1.get("company_id").map(String::as_str), Some("company_1"));

        let notes = harness.crm.notes().await;
        assert_eq!(notes.len(), 1);
        assert!(notes[0].3.contains("hi, this is jane from acme"));

        assert_eq!(state_of(&harness).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn task_confirm_requires_assignee_via_member_picker() {
        let mut task = SuggestedAction::new(Intent::CreateTask);
        task.set_field("title", "Follow up with Jane");
        let harness = harness(ScriptedClassifier::new(task));
        harness
            .crm
            .seed_members(vec![
                crate::crm::WorkspaceMember { id: "member_1".to_owned(), name: "Sam".to_owned() },
                crate::crm::WorkspaceMember { id: "member_2".to_owned(), name: "Rita".to_owned() },
            ])
            .await;
        harness.engine.handle(forwarded("todo")).await.expect("forward");
        harness.engine.handle(command("done", "make a task")).await.expect("done");

        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("confirm");
        assert!(matches!(replies[0], EngineReply::AssigneePage { page: 0, .. }));

        harness
            .engine
            .handle(press(OWNER, CallbackAction::AssigneePick { index: 1 }))
            .await
            .expect("pick");
        let replies =
            harness.engine.handle(press(OWNER, CallbackAction::Confirm)).await.expect("execute");

        assert!(matches!(replies[0], EngineReply::Report(_)));
        let created = harness.crm.created_records().await;
        assert_eq!(created[0].0, CrmObject::Tasks);
        assert_eq!(created[0].1.get("assignee_id").map(String::as_str), Some("member_2"));
    }
}
