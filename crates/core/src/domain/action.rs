use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crm::CrmObject;

/// The mutation the classifier believes the user wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CreatePerson,
    CreateCompany,
    CreateDeal,
    CreateTask,
    AddNote,
    AddToList,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatePerson => "create_person",
            Self::CreateCompany => "create_company",
            Self::CreateDeal => "create_deal",
            Self::CreateTask => "create_task",
            Self::AddNote => "add_note",
            Self::AddToList => "add_to_list",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create_person" => Self::CreatePerson,
            "create_company" => Self::CreateCompany,
            "create_deal" => Self::CreateDeal,
            "create_task" => Self::CreateTask,
            "add_note" => Self::AddNote,
            "add_to_list" => Self::AddToList,
            _ => Self::Unknown,
        }
    }

    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            Self::CreatePerson | Self::CreateCompany | Self::CreateDeal | Self::CreateTask
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CreatePerson => "Create person",
            Self::CreateCompany => "Create company",
            Self::CreateDeal => "Create deal",
            Self::CreateTask => "Create task",
            Self::AddNote => "Add note",
            Self::AddToList => "Add to list",
            Self::Unknown => "Unknown action",
        }
    }

    /// Object a creation intent writes into, if any.
    pub fn target(&self) -> Option<CrmObject> {
        match self {
            Self::CreatePerson => Some(CrmObject::People),
            Self::CreateCompany => Some(CrmObject::Companies),
            Self::CreateDeal => Some(CrmObject::Deals),
            Self::CreateTask => Some(CrmObject::Tasks),
            Self::AddNote | Self::AddToList | Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outstanding question blocking confirmation. At most one active
/// clarification per field; answering a field removes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub field: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Clarification {
    pub fn free_text(field: impl Into<String>, question: impl Into<String>) -> Self {
        Self { field: field.into(), question: question.into(), options: None, reason: None }
    }

    pub fn with_options(
        field: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self { field: field.into(), question: question.into(), options: Some(options), reason: None }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A record creation that must land before the main action because the main
/// action references it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteAction {
    pub intent: Intent,
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Classifier output: the proposed CRM mutation plus everything still
/// standing between it and execution. Mutated locally as clarifications and
/// edits are applied, consumed exactly once by the executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub intent: Intent,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object: Option<CrmObject>,
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
    #[serde(default)]
    pub missing_required: Vec<String>,
    #[serde(default)]
    pub clarifications_needed: Vec<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_title: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl SuggestedAction {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            confidence: 0.0,
            target_object: intent.target(),
            extracted: BTreeMap::new(),
            missing_required: Vec::new(),
            clarifications_needed: Vec::new(),
            note_title: None,
            prerequisites: Vec::new(),
            reasoning: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.extracted.get(name).map(String::as_str)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extracted.insert(name.into(), value.into());
    }

    pub fn clear_field(&mut self, name: &str) {
        self.extracted.remove(name);
    }

    pub fn has_clarifications(&self) -> bool {
        !self.clarifications_needed.is_empty()
    }

    pub fn clarification_for(&self, field: &str) -> Option<&Clarification> {
        self.clarifications_needed.iter().find(|c| c.field == field)
    }

    pub fn remove_clarification(&mut self, field: &str) {
        self.clarifications_needed.retain(|c| c.field != field);
    }

    /// Insert keeping the one-per-field invariant: an existing entry for the
    /// same field is replaced in place rather than duplicated.
    pub fn upsert_clarification(&mut self, clarification: Clarification) {
        if let Some(existing) =
            self.clarifications_needed.iter_mut().find(|c| c.field == clarification.field)
        {
            *existing = clarification;
        } else {
            self.clarifications_needed.push(clarification);
        }
    }

    pub fn prepend_clarification(&mut self, clarification: Clarification) {
        self.remove_clarification(&clarification.field);
        self.clarifications_needed.insert(0, clarification);
    }

    // Typed accessors over the open extraction map. The map itself stays
    // open so fields the executor does not know about still flow through to
    // rendering and notes.

    pub fn name(&self) -> Option<&str> {
        self.field("name").or_else(|| self.field("full_name"))
    }

    pub fn company_name(&self) -> Option<&str> {
        self.field("company").or_else(|| self.field("company_name"))
    }

    pub fn domain_hint(&self) -> Option<&str> {
        self.field("domain").or_else(|| self.field("company_domain"))
    }

    pub fn deadline_hint(&self) -> Option<&str> {
        self.field("deadline").or_else(|| self.field("due_date"))
    }

    pub fn target_name(&self) -> Option<&str> {
        self.field("target_name").or_else(|| self.field("list_name"))
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.field("parent_id")
    }

    pub fn parent_object(&self) -> Option<CrmObject> {
        self.field("parent_object").and_then(CrmObject::parse)
    }

    pub fn set_parent(&mut self, object: CrmObject, id: impl Into<String>) {
        self.set_field("parent_object", object.as_str());
        self.set_field("parent_id", id);
    }

    pub fn assignee(&self) -> Option<&str> {
        self.field("assignee_id").or_else(|| self.field("assignee"))
    }
}
