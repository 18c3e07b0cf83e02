use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use dossier_core::classifier::{Classifier, ClassifierError};
use dossier_core::domain::action::SuggestedAction;
use dossier_core::domain::session::ForwardedMessageEntry;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Classifier backed by a JSON-mode LLM completion. The model is asked for
/// a single JSON object in the `SuggestedAction` shape; anything else is a
/// `Malformed` error, never a guess.
pub struct LlmClassifier<C> {
    client: C,
}

impl<C> LlmClassifier<C>
where
    C: LlmClient,
{
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> Classifier for LlmClassifier<C>
where
    C: LlmClient,
{
    async fn analyze(
        &self,
        messages: &[ForwardedMessageEntry],
        instruction: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        let prompt = analysis_prompt(messages, instruction, schema);
        let raw = self
            .client
            .complete(&prompt)
            .await
            .map_err(|error| ClassifierError::Failed(error.to_string()))?;
        debug!(event_name = "classifier.analysis_received", bytes = raw.len(), "llm responded");
        parse_action(&raw)
    }

    async fn process_clarification(
        &self,
        action: &SuggestedAction,
        field: &str,
        answer: &str,
        schema: Option<&serde_json::Value>,
    ) -> Result<SuggestedAction, ClassifierError> {
        let prompt = clarification_prompt(action, field, answer, schema);
        let raw = self
            .client
            .complete(&prompt)
            .await
            .map_err(|error| ClassifierError::Failed(error.to_string()))?;
        parse_action(&raw)
    }
}

fn analysis_prompt(
    messages: &[ForwardedMessageEntry],
    instruction: &str,
    schema: Option<&serde_json::Value>,
) -> String {
    let mut prompt = String::from(
        "You convert forwarded chat conversations into one proposed CRM action.\n\
         Reply with a single JSON object with fields: intent (create_person|\
         create_company|create_deal|create_task|add_note|add_to_list|unknown), \
         confidence (0..1), extracted (string map), missing_required (string \
         array), clarifications_needed (array of {field, question, options?, \
         reason?}), note_title?, prerequisites (array of {intent, extracted, \
         reason?}), reasoning?.\n\
         If the instruction matches \"add to X\" and X is ambiguous, ask a \
         target_type clarification with options List, Company, Person.\n\n",
    );
    if let Some(schema) = schema {
        prompt.push_str("Workspace schema:\n");
        prompt.push_str(&schema.to_string());
        prompt.push_str("\n\n");
    }
    prompt.push_str("Instruction: ");
    prompt.push_str(instruction);
    prompt.push_str("\n\nConversation:\n");
    for entry in messages {
        prompt.push_str(&format!("{}: {}\n", entry.sender_name, entry.text));
    }
    prompt
}

fn clarification_prompt(
    action: &SuggestedAction,
    field: &str,
    answer: &str,
    schema: Option<&serde_json::Value>,
) -> String {
    let action_json = serde_json::to_string(action).unwrap_or_else(|_| "{}".to_owned());
    let mut prompt = format!(
        "Update this proposed CRM action with the user's answer and return \
         the full updated action as a single JSON object in the same shape. \
         Remove the answered clarification; add new ones only if the answer \
         makes another field ambiguous.\n\nAction: {action_json}\n\
         Answered field: {field}\nAnswer: {answer}\n"
    );
    if let Some(schema) = schema {
        prompt.push_str("\nWorkspace schema:\n");
        prompt.push_str(&schema.to_string());
    }
    prompt
}

/// Parse the model output into a `SuggestedAction`, tolerating markdown
/// code fences around the JSON body.
pub fn parse_action(raw: &str) -> Result<SuggestedAction, ClassifierError> {
    let body = strip_fences(raw);
    serde_json::from_str(body).map_err(|error| {
        ClassifierError::Malformed(format!("{error} in classifier output"))
    })
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use dossier_core::classifier::Classifier;
    use dossier_core::domain::action::Intent;

    use super::{parse_action, LlmClassifier, LlmClient};

    struct CannedLlm {
        response: &'static str,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.response.to_owned())
        }
    }

    const PERSON_JSON: &str = r#"{
        "intent": "create_person",
        "confidence": 0.87,
        "extracted": {"name": "Jane Doe", "company": "Acme"},
        "clarifications_needed": [
            {"field": "email", "question": "What is Jane's email?"}
        ]
    }"#;

    #[test]
    fn parses_plain_json() {
        let action = parse_action(PERSON_JSON).expect("parse");
        assert_eq!(action.intent, Intent::CreatePerson);
        assert_eq!(action.field("name"), Some("Jane Doe"));
        assert_eq!(action.clarifications_needed.len(), 1);
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = format!("```json\n{PERSON_JSON}\n```");
        let action = parse_action(&fenced).expect("parse");
        assert_eq!(action.intent, Intent::CreatePerson);
    }

    #[test]
    fn prose_is_rejected_not_guessed() {
        let error = parse_action("Sure! I'd suggest creating a person.").expect_err("must fail");
        assert!(error.to_string().contains("unusable"));
    }

    #[tokio::test]
    async fn analyze_round_trips_through_the_client() {
        let classifier = LlmClassifier::new(CannedLlm { response: PERSON_JSON });
        let action = classifier.analyze(&[], "create a person", None).await.expect("analyze");
        assert_eq!(action.intent, Intent::CreatePerson);
        assert_eq!(action.field("company"), Some("Acme"));
    }
}
