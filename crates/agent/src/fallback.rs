//! Deterministic keyword classifier. Used when no LLM is configured; good
//! enough to drive the whole confirmation flow for simple instructions,
//! and fully predictable in tests.

use async_trait::async_trait;

use dossier_core::classifier::{Classifier, ClassifierError};
use dossier_core::domain::action::{Clarification, Intent, SuggestedAction};
use dossier_core::domain::session::ForwardedMessageEntry;

#[derive(Clone, Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn analyze(
        &self,
        messages: &[ForwardedMessageEntry],
        instruction: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        let normalized = instruction.to_lowercase();
        let intent = detect_intent(&normalized);

        let mut action = SuggestedAction::new(intent);
        action.confidence = if intent == Intent::Unknown { 0.2 } else { 0.6 };

        if let Some(sender) = messages.first() {
            if matches!(intent, Intent::CreatePerson) {
                action.set_field("name", sender.sender_name.clone());
            }
        }
        if let Some(company) = extract_company(instruction) {
            if matches!(intent, Intent::CreatePerson | Intent::CreateDeal | Intent::CreateTask) {
                action.set_field("company", company);
            } else if intent == Intent::CreateCompany {
                action.set_field("name", company);
            }
        }

        match intent {
            Intent::CreatePerson if action.company_name().is_none() => {
                action.upsert_clarification(Clarification::free_text(
                    "company",
                    "Which company is this person with?",
                ));
            }
            Intent::CreateCompany if action.name().is_none() => {
                action.upsert_clarification(Clarification::free_text(
                    "name",
                    "What is the company called?",
                ));
            }
            Intent::CreateDeal => {
                action.set_field("name", instruction.trim());
            }
            Intent::CreateTask => {
                action.set_field("title", instruction.trim());
            }
            Intent::Unknown => {
                action.upsert_clarification(
                    Clarification::with_options(
                        "intent",
                        "What should I do with these messages?",
                        vec![
                            "Create person".to_owned(),
                            "Create company".to_owned(),
                            "Create deal".to_owned(),
                            "Create task".to_owned(),
                            "Add note".to_owned(),
                        ],
                    )
                    .reason("low_confidence"),
                );
            }
            _ => {}
        }

        Ok(action)
    }

    async fn process_clarification(
        &self,
        action: &SuggestedAction,
        field: &str,
        answer: &str,
        _schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        let mut updated = action.clone();
        updated.remove_clarification(field);

        if field == "intent" {
            updated.intent = detect_intent(&answer.to_lowercase());
            updated.target_object = updated.intent.target();
            updated.confidence = 0.6;
        } else {
            updated.set_field(field, answer.trim());
        }
        Ok(updated)
    }
}

fn detect_intent(normalized: &str) -> Intent {
    if normalized.contains("person") || normalized.contains("contact") {
        Intent::CreatePerson
    } else if normalized.contains("company") || normalized.contains("account") {
        Intent::CreateCompany
    } else if normalized.contains("deal") || normalized.contains("opportunity") {
        Intent::CreateDeal
    } else if normalized.contains("task")
        || normalized.contains("todo")
        || normalized.contains("remind")
        || normalized.contains("follow up")
    {
        Intent::CreateTask
    } else if normalized.contains("list") {
        Intent::AddToList
    } else if normalized.contains("note") || normalized.contains("attach") {
        Intent::AddNote
    } else {
        Intent::Unknown
    }
}

/// "at Acme" / "from Acme" / "with Acme" — first capitalized token after a
/// linking word.
fn extract_company(instruction: &str) -> Option<String> {
    let tokens: Vec<&str> = instruction.split_whitespace().collect();
    for window in tokens.windows(2) {
        let [link, candidate] = window else { continue };
        if !matches!(link.to_lowercase().as_str(), "at" | "from" | "with") {
            continue;
        }
        let candidate = candidate.trim_matches(|ch: char| !ch.is_alphanumeric());
        if candidate.chars().next().is_some_and(char::is_uppercase) {
            return Some(candidate.to_owned());
        }
    }
    None
}
