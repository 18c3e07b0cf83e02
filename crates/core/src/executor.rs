//! Composite-action execution: prerequisite creations strictly before the
//! main action, search-before-create for companies, one deterministic
//! deadline resolver, and an unconditional conversation note on success.
//!
//! Partial-failure semantics: any prerequisite failure aborts the whole
//! operation — the main action is never attempted, and the prerequisite's
//! own error is what the user sees.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::crm::{CrmObject, RecordMutator, Registry};
use crate::deadline::{parse_deadline, resolve_deadline};
use crate::domain::action::{Intent, SuggestedAction};
use crate::domain::session::{render_transcript, ForwardedMessageEntry};
use crate::errors::EngineError;
use crate::matcher::match_reference;

/// A record surfaced in the execution report: the primary outcome or an
/// "also created" prerequisite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRef {
    pub object: CrmObject,
    pub id: String,
    pub url: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionReport {
    pub intent: Intent,
    pub primary: RecordRef,
    pub also_created: Vec<RecordRef>,
    pub note_id: Option<String>,
}

/// Extraction keys that steer execution rather than describing the record.
const CONTROL_KEYS: &[&str] = &[
    "parent_id",
    "parent_object",
    "target_type",
    "target_name",
    "list_id",
];

pub struct CompositeExecutor {
    registry: Arc<dyn Registry>,
    mutator: Arc<dyn RecordMutator>,
}

impl CompositeExecutor {
    pub fn new(registry: Arc<dyn Registry>, mutator: Arc<dyn RecordMutator>) -> Self {
        Self { registry, mutator }
    }

    /// Run a fully-resolved action as one logical unit.
    pub async fn execute(
        &self,
        action: &SuggestedAction,
        instruction: Option<&str>,
        queued: &[ForwardedMessageEntry],
        today: NaiveDate,
    ) -> Result<ExecutionReport, EngineError> {
        let mut also_created = Vec::new();
        let mut prerequisite_company: Option<RecordRef> = None;

        for prerequisite in &action.prerequisites {
            let object = match prerequisite.intent {
                Intent::CreateCompany => CrmObject::Companies,
                Intent::CreatePerson => CrmObject::People,
                other => {
                    warn!(
                        event_name = "executor.prerequisite_skipped",
                        intent = %other,
                        "unsupported prerequisite intent"
                    );
                    continue;
                }
            };

            let name = prerequisite
                .extracted
                .get("name")
                .or_else(|| prerequisite.extracted.get("company"))
                .cloned()
                .unwrap_or_default();

            let resolved = self
                .resolve_or_create(object, &name, &prerequisite.extracted, &mut also_created)
                .await
                .map_err(|error| EngineError::Prerequisite {
                    label: object.singular().to_owned(),
                    message: error.user_message(),
                })?;

            if object == CrmObject::Companies && prerequisite_company.is_none() {
                prerequisite_company = Some(resolved);
            }
        }

        let primary = match action.intent {
            Intent::CreateCompany => {
                self.create_main_record(CrmObject::Companies, action, None, today).await?
            }
            Intent::CreatePerson => {
                let company =
                    self.associated_company(action, &prerequisite_company, &mut also_created).await?;
                self.create_main_record(CrmObject::People, action, company, today).await?
            }
            Intent::CreateDeal => {
                let company =
                    self.associated_company(action, &prerequisite_company, &mut also_created).await?;
                self.create_main_record(CrmObject::Deals, action, company, today).await?
            }
            Intent::CreateTask => {
                let company =
                    self.associated_company(action, &prerequisite_company, &mut also_created).await?;
                self.create_task(action, instruction, company, today).await?
            }
            Intent::AddNote => self.note_parent(action)?,
            Intent::AddToList => self.add_to_list(action).await?,
            Intent::Unknown => {
                return Err(EngineError::Crm(crate::crm::CrmError::Rejected(
                    "cannot execute an unclassified action".to_owned(),
                )));
            }
        };

        // The conversation itself always lands as a note on the parent
        // record, independent of which intent ran.
        let note_id = if queued.is_empty() {
            None
        } else {
            let title = action
                .note_title
                .clone()
                .unwrap_or_else(|| "Forwarded conversation".to_owned());
            let content = render_transcript(queued);
            Some(
                self.mutator
                    .create_note(primary.object, &primary.id, &title, &content)
                    .await
                    .map_err(EngineError::from)?,
            )
        };

        info!(
            event_name = "executor.completed",
            intent = %action.intent,
            record_id = %primary.id,
            also_created = also_created.len(),
            note_attached = note_id.is_some(),
            "composite action executed"
        );

        Ok(ExecutionReport { intent: action.intent, primary, also_created, note_id })
    }

    /// Search-before-create: reuse an existing record when the matcher is
    /// confident the top hit is the same entity.
    async fn resolve_or_create(
        &self,
        object: CrmObject,
        name: &str,
        fields: &BTreeMap<String, String>,
        also_created: &mut Vec<RecordRef>,
    ) -> Result<RecordRef, EngineError> {
        if !name.is_empty() {
            let candidates = self.registry.search_records(object, name).await?;
            let verdict = match_reference(name, fields.get("domain").map(String::as_str), &candidates);
            if verdict.is_high() {
                let top = &candidates[0];
                info!(
                    event_name = "executor.record_reused",
                    object = %object,
                    record_id = %top.id,
                    reason = %verdict.reason,
                    "existing record matched, skipping create"
                );
                return Ok(RecordRef {
                    object,
                    id: top.id.clone(),
                    url: String::new(),
                    name: top.name.clone(),
                });
            }
        }

        let mut payload = fields.clone();
        if !name.is_empty() {
            payload.entry("name".to_owned()).or_insert_with(|| name.to_owned());
        }
        let created = self.mutator.create_record(object, &payload).await?;
        let record = RecordRef {
            object,
            id: created.id,
            url: created.url,
            name: name.to_owned(),
        };
        also_created.push(record.clone());
        Ok(record)
    }

    /// Resolve the company a person/deal/task should link to, unless a
    /// prerequisite already produced one.
    async fn associated_company(
        &self,
        action: &SuggestedAction,
        prerequisite_company: &Option<RecordRef>,
        also_created: &mut Vec<RecordRef>,
    ) -> Result<Option<RecordRef>, EngineError> {
        if let Some(company) = prerequisite_company {
            return Ok(Some(company.clone()));
        }
        let Some(company_name) = action.company_name() else {
            return Ok(None);
        };
        let mut fields = BTreeMap::new();
        if let Some(domain) = action.domain_hint() {
            fields.insert("domain".to_owned(), domain.to_owned());
        }
        self.resolve_or_create(CrmObject::Companies, company_name, &fields, also_created)
            .await
            .map(Some)
    }

    async fn create_main_record(
        &self,
        object: CrmObject,
        action: &SuggestedAction,
        company: Option<RecordRef>,
        _today: NaiveDate,
    ) -> Result<RecordRef, EngineError> {
        let mut fields = record_fields(action);
        if let Some(company) = company {
            fields.insert("company_id".to_owned(), company.id);
        }
        if object == CrmObject::Deals {
            if let Some(value) = fields.get("value") {
                if let Some(normalized) = normalize_amount(value) {
                    fields.insert("value".to_owned(), normalized);
                }
            }
        }

        let created = self.mutator.create_record(object, &fields).await?;
        Ok(RecordRef {
            object,
            id: created.id,
            url: created.url,
            name: action.name().or(action.field("title")).unwrap_or("record").to_owned(),
        })
    }

    async fn create_task(
        &self,
        action: &SuggestedAction,
        instruction: Option<&str>,
        company: Option<RecordRef>,
        today: NaiveDate,
    ) -> Result<RecordRef, EngineError> {
        let mut fields = record_fields(action);
        if let Some(company) = company {
            fields.insert("company_id".to_owned(), company.id);
        }

        // The original instruction text wins over the classifier's
        // structured field: relative dates must go through the one
        // deterministic resolver.
        let deadline = instruction
            .and_then(|text| resolve_deadline(text, today))
            .or_else(|| action.deadline_hint().and_then(|hint| parse_deadline(hint, today)));
        if let Some(deadline) = deadline {
            fields.insert("deadline".to_owned(), deadline.format("%Y-%m-%d").to_string());
        }
        if let Some(assignee) = action.assignee() {
            fields.insert("assignee_id".to_owned(), assignee.to_owned());
        }

        let created = self.mutator.create_record(CrmObject::Tasks, &fields).await?;
        Ok(RecordRef {
            object: CrmObject::Tasks,
            id: created.id,
            url: created.url,
            name: action.field("title").or(action.name()).unwrap_or("task").to_owned(),
        })
    }

    fn note_parent(&self, action: &SuggestedAction) -> Result<RecordRef, EngineError> {
        let (Some(object), Some(id)) = (action.parent_object(), action.parent_id()) else {
            return Err(EngineError::Crm(crate::crm::CrmError::Rejected(
                "note has no resolved parent record".to_owned(),
            )));
        };
        Ok(RecordRef {
            object,
            id: id.to_owned(),
            url: String::new(),
            name: action.target_name().unwrap_or(object.singular()).to_owned(),
        })
    }

    async fn add_to_list(&self, action: &SuggestedAction) -> Result<RecordRef, EngineError> {
        let Some(list_id) = action.field("list_id").or(action.parent_id()) else {
            return Err(EngineError::Crm(crate::crm::CrmError::Rejected(
                "no resolved list to add to".to_owned(),
            )));
        };
        let Some(record_id) = action.field("record_id") else {
            return Err(EngineError::Crm(crate::crm::CrmError::Rejected(
                "no resolved record to add to the list".to_owned(),
            )));
        };

        self.mutator.add_to_list(list_id, record_id).await?;
        Ok(RecordRef {
            object: CrmObject::Lists,
            id: list_id.to_owned(),
            url: String::new(),
            name: action.target_name().unwrap_or("list").to_owned(),
        })
    }
}

/// Record payload: everything extracted minus the control keys that steer
/// execution. Unknown extra fields deliberately pass through.
fn record_fields(action: &SuggestedAction) -> BTreeMap<String, String> {
    action
        .extracted
        .iter()
        .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()) && !key.ends_with("_candidates"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Normalize free-text money ("$50k", "1.2m", "7,500") to a plain decimal
/// string. Unparseable input is passed through untouched by the caller.
fn normalize_amount(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('$').replace(',', "");
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let (number, multiplier) = if let Some(prefix) = lower.strip_suffix('k') {
        (prefix, Decimal::new(1_000, 0))
    } else if let Some(prefix) = lower.strip_suffix('m') {
        (prefix, Decimal::new(1_000_000, 0))
    } else {
        (lower.as_str(), Decimal::ONE)
    };

    let amount: Decimal = number.parse().ok()?;
    Some((amount * multiplier).normalize().to_string())
}
