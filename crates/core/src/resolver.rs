//! Deterministic safety net for ambiguous "add to X" instructions.
//!
//! The classifier is prompted to ask whether X is a list, a company, or a
//! person, but being probabilistic it sometimes emits a creation intent
//! directly. This module corrects that class of mistake with fixed rules,
//! and walks the follow-up search/selection exchange once the user answers.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crm::{CrmError, CrmObject, Registry, SearchResult};
use crate::domain::action::{Clarification, Intent, SuggestedAction};

pub const TARGET_TYPE_FIELD: &str = "target_type";
pub const TARGET_TYPE_OPTIONS: [&str; 3] = ["List", "Company", "Person"];

/// Max options offered when the chosen registry has matches.
pub const SELECTION_LIMIT: usize = 5;

/// Extraction key holding the serialized candidate set behind a
/// `*_selection` clarification.
fn candidates_key(selection_field: &str) -> String {
    format!("{selection_field}_candidates")
}

/// Capture group of `^add\s+to\s+(\S+)`, case-insensitive.
pub fn instruction_target(instruction: &str) -> Option<&str> {
    let mut tokens = instruction.split_whitespace();
    let first = tokens.next()?;
    let second = tokens.next()?;
    if !first.eq_ignore_ascii_case("add") || !second.eq_ignore_ascii_case("to") {
        return None;
    }
    tokens.next()
}

/// Correct a classifier that answered an "add to X" instruction with a
/// creation intent: force the intent to `add_note` and prepend the
/// target-type question. Returns whether a correction was applied.
pub fn enforce_target_type(instruction: &str, action: &mut SuggestedAction) -> bool {
    let Some(target) = instruction_target(instruction) else {
        return false;
    };
    if !action.intent.is_creation() || action.clarification_for(TARGET_TYPE_FIELD).is_some() {
        return false;
    }

    debug!(
        event_name = "resolver.target_type_enforced",
        original_intent = %action.intent,
        "classifier emitted a creation intent for an add-to instruction"
    );
    action.intent = Intent::AddNote;
    action.target_object = None;
    if action.target_name().is_none() {
        action.set_field("target_name", target);
    }
    action.prepend_clarification(
        Clarification::with_options(
            TARGET_TYPE_FIELD,
            format!("Is \"{target}\" a list, a company, or a person?"),
            TARGET_TYPE_OPTIONS.iter().map(|option| (*option).to_owned()).collect(),
        )
        .reason("ambiguous_target"),
    );
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetTypeOutcome {
    /// Matches were found; a `*_selection` clarification with up to
    /// [`SELECTION_LIMIT`] options was stored on the action.
    SelectionOffered { field: String, count: usize },
    /// Nothing matched; the user is asked for the full name instead.
    NotFound { field: String },
}

/// Handle the user's answer to the target-type question: search the chosen
/// registry for the extracted target name and stage the next question.
pub async fn resolve_target_type(
    registry: &dyn Registry,
    action: &mut SuggestedAction,
    choice: &str,
) -> Result<TargetTypeOutcome, CrmError> {
    let object = match choice.trim().to_ascii_lowercase().as_str() {
        "list" => CrmObject::Lists,
        "company" => CrmObject::Companies,
        "person" => CrmObject::People,
        other => {
            return Err(CrmError::Rejected(format!("unsupported target type `{other}`")));
        }
    };

    action.remove_clarification(TARGET_TYPE_FIELD);
    action.set_field(TARGET_TYPE_FIELD, object.singular());

    let query = action.target_name().unwrap_or_default().to_owned();
    let results = registry.search_records(object, &query).await?;

    if results.is_empty() {
        let field = "target_name".to_owned();
        action.upsert_clarification(
            Clarification::free_text(
                field.clone(),
                format!("I couldn't find a {} named \"{query}\". What is its full name?",
                    object.singular()),
            )
            .reason("not_found"),
        );
        return Ok(TargetTypeOutcome::NotFound { field });
    }

    let field = format!("{}_selection", object.singular());
    let shortlist: Vec<SearchResult> =
        results.into_iter().take(SELECTION_LIMIT).collect();
    let options: Vec<String> = shortlist.iter().map(|result| result.name.clone()).collect();
    let encoded = serde_json::to_string(&shortlist)
        .map_err(|error| CrmError::Rejected(error.to_string()))?;

    action.set_field(candidates_key(&field), encoded);
    action.upsert_clarification(Clarification::with_options(
        field.clone(),
        format!("Which {} did you mean?", object.singular()),
        options,
    ));
    let count = shortlist.len();
    Ok(TargetTypeOutcome::SelectionOffered { field, count })
}

/// Handle a `*_selection` answer: map the chosen name back to its record
/// id, set it as the action's parent, and clear the selection bookkeeping.
pub fn apply_target_selection(
    action: &mut SuggestedAction,
    selection_field: &str,
    chosen: &str,
) -> Option<SearchResult> {
    let key = candidates_key(selection_field);
    let candidates: Vec<SearchResult> =
        serde_json::from_str(action.field(&key)?).unwrap_or_default();
    let picked = candidates.into_iter().find(|candidate| candidate.name == chosen)?;

    let object = selection_field
        .strip_suffix("_selection")
        .and_then(CrmObject::parse)
        .unwrap_or(CrmObject::Companies);
    action.set_parent(object, picked.id.clone());
    action.clear_field(&key);
    action.remove_clarification(selection_field);
    Some(picked)
}

#[cfg(test)]
mod tests {
    use super::{
        apply_target_selection, enforce_target_type, instruction_target, resolve_target_type,
        TargetTypeOutcome, TARGET_TYPE_FIELD,
    };
    use crate::crm::{CrmObject, InMemoryCrm, SearchResult};
    use crate::domain::action::{Intent, SuggestedAction};

    #[test]
    fn pattern_requires_leading_add_to() {
        assert_eq!(instruction_target("add to vendors"), Some("vendors"));
        assert_eq!(instruction_target("Add To Vendors please"), Some("Vendors"));
        assert_eq!(instruction_target("please add to vendors"), None);
        assert_eq!(instruction_target("add vendors"), None);
    }

    #[test]
    fn creation_intent_is_rewritten_to_add_note() {
        let mut action = SuggestedAction::new(Intent::CreateCompany);
        let corrected = enforce_target_type("add to vendors", &mut action);

        assert!(corrected);
        assert_eq!(action.intent, Intent::AddNote);
        assert_eq!(action.clarifications_needed[0].field, TARGET_TYPE_FIELD);
        assert_eq!(action.field("target_name"), Some("vendors"));
    }

    #[test]
    fn existing_target_type_question_is_left_alone() {
        let mut action = SuggestedAction::new(Intent::CreateCompany);
        enforce_target_type("add to vendors", &mut action);
        let again = {
            let mut action = action.clone();
            action.intent = Intent::CreateCompany;
            enforce_target_type("add to vendors", &mut action)
        };
        assert!(!again);
    }

    #[test]
    fn non_creation_intents_are_not_corrected() {
        let mut action = SuggestedAction::new(Intent::AddToList);
        assert!(!enforce_target_type("add to vendors", &mut action));
        assert_eq!(action.intent, Intent::AddToList);
    }

    #[tokio::test]
    async fn answer_with_matches_offers_a_selection() {
        let crm = InMemoryCrm::default();
        crm.seed_search(
            CrmObject::Lists,
            "vendors",
            vec![
                SearchResult::new("list_1", "Vendors"),
                SearchResult::new("list_2", "Vendors EMEA"),
            ],
        )
        .await;

        let mut action = SuggestedAction::new(Intent::CreateCompany);
        enforce_target_type("add to vendors", &mut action);

        let outcome = resolve_target_type(&crm, &mut action, "List").await.expect("resolve");

        assert_eq!(
            outcome,
            TargetTypeOutcome::SelectionOffered { field: "list_selection".to_owned(), count: 2 }
        );
        let selection = action.clarification_for("list_selection").expect("selection question");
        assert_eq!(selection.options.as_deref().unwrap().len(), 2);
        assert!(action.clarification_for(TARGET_TYPE_FIELD).is_none());
    }

    #[tokio::test]
    async fn answer_without_matches_asks_for_full_name() {
        let crm = InMemoryCrm::default();
        let mut action = SuggestedAction::new(Intent::CreateCompany);
        enforce_target_type("add to vendors", &mut action);

        let outcome = resolve_target_type(&crm, &mut action, "Company").await.expect("resolve");

        assert_eq!(outcome, TargetTypeOutcome::NotFound { field: "target_name".to_owned() });
        let question = action.clarification_for("target_name").expect("full-name question");
        assert_eq!(question.reason.as_deref(), Some("not_found"));
        assert!(question.options.is_none());
    }

    #[tokio::test]
    async fn selection_maps_name_back_to_record_id() {
        let crm = InMemoryCrm::default();
        crm.seed_search(
            CrmObject::Lists,
            "vendors",
            vec![
                SearchResult::new("list_1", "Vendors"),
                SearchResult::new("list_2", "Vendors EMEA"),
            ],
        )
        .await;

        let mut action = SuggestedAction::new(Intent::CreateCompany);
        enforce_target_type("add to vendors", &mut action);
        resolve_target_type(&crm, &mut action, "List").await.expect("resolve");

        let picked =
            apply_target_selection(&mut action, "list_selection", "Vendors EMEA").expect("pick");

        assert_eq!(picked.id, "list_2");
        assert_eq!(action.parent_id(), Some("list_2"));
        assert_eq!(action.parent_object(), Some(CrmObject::Lists));
        assert!(action.clarification_for("list_selection").is_none());
        assert!(action.field("list_selection_candidates").is_none());
    }
}
