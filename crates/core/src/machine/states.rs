use serde::{Deserialize, Serialize};

use crate::crm::{CrmObject, SearchResult, WorkspaceMember};
use crate::domain::action::Clarification;
use crate::domain::ids::UserId;

/// Workspace members offered per keyboard page in the assignee picker.
pub const ASSIGNEE_PAGE_SIZE: usize = 5;

/// Per-session conversation state. Initial state is `Idle`; every inbound
/// event is dispatched through the active variant's handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    GatheringMessages,
    AwaitingConfirmation,
    AwaitingClarification {
        /// Index into the question snapshot taken when the loop started.
        index: usize,
        questions: Vec<Clarification>,
    },
    AwaitingEdit {
        field: String,
        original_value: Option<String>,
    },
    AwaitingAssignee {
        page: usize,
        members: Vec<WorkspaceMember>,
    },
    AwaitingAssigneeInput,
    AwaitingNoteParentType,
    AwaitingNoteParentSearch {
        parent_type: CrmObject,
    },
    AwaitingNoteParentSelection {
        parent_type: CrmObject,
        results: Vec<SearchResult>,
    },
    Executing,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::GatheringMessages => "gathering_messages",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::AwaitingClarification { .. } => "awaiting_clarification",
            Self::AwaitingEdit { .. } => "awaiting_edit",
            Self::AwaitingAssignee { .. } => "awaiting_assignee",
            Self::AwaitingAssigneeInput => "awaiting_assignee_input",
            Self::AwaitingNoteParentType => "awaiting_note_parent_type",
            Self::AwaitingNoteParentSearch { .. } => "awaiting_note_parent_search",
            Self::AwaitingNoteParentSelection { .. } => "awaiting_note_parent_selection",
            Self::Executing => "executing",
        }
    }

    /// States in which a free-text message is treated as an instruction
    /// candidate for forward correlation rather than a structured answer.
    pub fn accepts_instruction(&self) -> bool {
        matches!(self, Self::Idle | Self::GatheringMessages)
    }
}

/// One button press, decoded from Telegram callback data. The payload
/// embeds the owning user so a press by anyone else in a group chat can be
/// rejected against the owner's session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackData {
    pub owner: UserId,
    pub action: CallbackAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Confirm,
    Cancel,
    Edit { field: String },
    ClarifyOption { value: String },
    ClarifySkip,
    ClarifyFreeText,
    SelectOption { index: usize },
    NoteParent { object: CrmObject },
    AssigneePage { page: usize },
    AssigneePick { index: usize },
    AssigneeManual,
}

impl CallbackData {
    pub fn new(owner: UserId, action: CallbackAction) -> Self {
        Self { owner, action }
    }

    /// Wire form: `<owner>|<verb>[:<arg>]`, kept short to stay inside
    /// Telegram's 64-byte callback-data limit.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.owner.0, self.action.encode())
    }

    pub fn parse(data: &str) -> Option<Self> {
        let (owner, verb) = data.split_once('|')?;
        Some(Self { owner: UserId(owner.parse().ok()?), action: CallbackAction::parse(verb)? })
    }
}

impl CallbackAction {
    fn encode(&self) -> String {
        match self {
            Self::Confirm => "confirm".to_owned(),
            Self::Cancel => "cancel".to_owned(),
            Self::Edit { field } => format!("edit:{field}"),
            Self::ClarifyOption { value } => format!("clarify:{value}"),
            Self::ClarifySkip => "skip".to_owned(),
            Self::ClarifyFreeText => "other".to_owned(),
            Self::SelectOption { index } => format!("select:{index}"),
            Self::NoteParent { object } => format!("parent:{}", object.as_str()),
            Self::AssigneePage { page } => format!("assignee_page:{page}"),
            Self::AssigneePick { index } => format!("assignee:{index}"),
            Self::AssigneeManual => "assignee_manual".to_owned(),
        }
    }

    fn parse(verb: &str) -> Option<Self> {
        if let Some((head, arg)) = verb.split_once(':') {
            return match head {
                "edit" => Some(Self::Edit { field: arg.to_owned() }),
                "clarify" => Some(Self::ClarifyOption { value: arg.to_owned() }),
                "select" => Some(Self::SelectOption { index: arg.parse().ok()? }),
                "parent" => Some(Self::NoteParent { object: CrmObject::parse(arg)? }),
                "assignee_page" => Some(Self::AssigneePage { page: arg.parse().ok()? }),
                "assignee" => Some(Self::AssigneePick { index: arg.parse().ok()? }),
                _ => None,
            };
        }
        match verb {
            "confirm" => Some(Self::Confirm),
            "cancel" => Some(Self::Cancel),
            "skip" => Some(Self::ClarifySkip),
            "other" => Some(Self::ClarifyFreeText),
            "assignee_manual" => Some(Self::AssigneeManual),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CallbackAction, CallbackData, SessionState};
    use crate::crm::CrmObject;
    use crate::domain::ids::UserId;

    #[test]
    fn callback_data_round_trips() {
        let cases = vec![
            CallbackAction::Confirm,
            CallbackAction::Cancel,
            CallbackAction::Edit { field: "company".to_owned() },
            CallbackAction::ClarifyOption { value: "Acme".to_owned() },
            CallbackAction::ClarifySkip,
            CallbackAction::ClarifyFreeText,
            CallbackAction::SelectOption { index: 3 },
            CallbackAction::NoteParent { object: CrmObject::People },
            CallbackAction::AssigneePage { page: 2 },
            CallbackAction::AssigneePick { index: 4 },
            CallbackAction::AssigneeManual,
        ];
        for action in cases {
            let data = CallbackData::new(UserId(42), action.clone());
            let parsed = CallbackData::parse(&data.encode()).expect("parse back");
            assert_eq!(parsed.owner, UserId(42));
            assert_eq!(parsed.action, action);
        }
    }

    #[test]
    fn malformed_callback_data_is_rejected() {
        assert!(CallbackData::parse("confirm").is_none());
        assert!(CallbackData::parse("x|confirm").is_none());
        assert!(CallbackData::parse("42|warp").is_none());
        assert!(CallbackData::parse("42|select:abc").is_none());
    }

    #[test]
    fn instruction_states_are_idle_and_gathering() {
        assert!(SessionState::Idle.accepts_instruction());
        assert!(SessionState::GatheringMessages.accepts_instruction());
        assert!(!SessionState::AwaitingConfirmation.accepts_instruction());
        assert!(!SessionState::Executing.accepts_instruction());
    }

    #[test]
    fn state_serialization_is_tagged() {
        let state = SessionState::AwaitingClarification { index: 1, questions: Vec::new() };
        let json = serde_json::to_string(&state).expect("serialize");
        assert!(json.contains("\"kind\":\"awaiting_clarification\""));
        let back: SessionState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
