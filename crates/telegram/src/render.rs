//! Reply rendering: engine replies become message text plus inline
//! keyboards. Keyboard callback data always embeds the owning user so the
//! engine can enforce the session owner lock.

use serde::Serialize;

use dossier_core::crm::CrmObject;
use dossier_core::domain::action::SuggestedAction;
use dossier_core::domain::ids::UserId;
use dossier_core::executor::ExecutionReport;
use dossier_core::machine::{
    CallbackAction, CallbackData, EngineReply, ASSIGNEE_PAGE_SIZE,
};

/// Fields surfaced first in an action summary, in display order.
const PRIORITY_FIELDS: &[&str] = &[
    "name",
    "full_name",
    "title",
    "company",
    "email",
    "phone",
    "value",
    "stage",
    "deadline",
    "due_date",
    "assignee",
];

/// Bookkeeping fields hidden from the summary.
const HIDDEN_FIELDS: &[&str] = &["parent_id", "parent_object", "target_type", "assignee_id"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    fn new(label: impl Into<String>, owner: UserId, action: CallbackAction) -> Self {
        Self {
            label: label.into(),
            callback_data: CallbackData::new(owner, action).encode(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        if !buttons.is_empty() {
            self.rows.push(buttons);
        }
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub keyboard: Option<InlineKeyboard>,
}

pub fn plain_message(text: impl Into<String>) -> OutboundMessage {
    OutboundMessage { text: text.into(), keyboard: None }
}

pub fn render_reply(reply: &EngineReply) -> OutboundMessage {
    match reply {
        EngineReply::Text(text) => plain_message(text.clone()),
        EngineReply::Summary { action, owner, queued } => summary_message(action, *owner, *queued),
        EngineReply::Question { clarification, owner } => {
            let mut keyboard = InlineKeyboard::default();
            if let Some(options) = &clarification.options {
                for chunk in options.chunks(2) {
                    keyboard = keyboard.row(
                        chunk
                            .iter()
                            .map(|option| {
                                InlineButton::new(
                                    option.clone(),
                                    *owner,
                                    CallbackAction::ClarifyOption { value: option.clone() },
                                )
                            })
                            .collect(),
                    );
                }
            }
            keyboard = keyboard.row(vec![
                InlineButton::new("Other…", *owner, CallbackAction::ClarifyFreeText),
                InlineButton::new("Skip", *owner, CallbackAction::ClarifySkip),
                InlineButton::new("Cancel", *owner, CallbackAction::Cancel),
            ]);
            OutboundMessage { text: clarification.question.clone(), keyboard: Some(keyboard) }
        }
        EngineReply::Selection { prompt, options, owner } => {
            let mut keyboard = InlineKeyboard::default();
            for (index, option) in options.iter().enumerate() {
                keyboard = keyboard.row(vec![InlineButton::new(
                    format!("{}. {option}", index + 1),
                    *owner,
                    CallbackAction::SelectOption { index },
                )]);
            }
            keyboard =
                keyboard.row(vec![InlineButton::new("Cancel", *owner, CallbackAction::Cancel)]);
            OutboundMessage { text: prompt.clone(), keyboard: Some(keyboard) }
        }
        EngineReply::AssigneePage { page, members, owner } => {
            let start = page * ASSIGNEE_PAGE_SIZE;
            let mut keyboard = InlineKeyboard::default();
            for (offset, member) in
                members.iter().skip(start).take(ASSIGNEE_PAGE_SIZE).enumerate()
            {
                keyboard = keyboard.row(vec![InlineButton::new(
                    member.name.clone(),
                    *owner,
                    CallbackAction::AssigneePick { index: start + offset },
                )]);
            }
            let mut nav = Vec::new();
            if *page > 0 {
                nav.push(InlineButton::new(
                    "‹ Prev",
                    *owner,
                    CallbackAction::AssigneePage { page: page - 1 },
                ));
            }
            if start + ASSIGNEE_PAGE_SIZE < members.len() {
                nav.push(InlineButton::new(
                    "Next ›",
                    *owner,
                    CallbackAction::AssigneePage { page: page + 1 },
                ));
            }
            keyboard = keyboard.row(nav);
            keyboard = keyboard.row(vec![
                InlineButton::new("Type a name…", *owner, CallbackAction::AssigneeManual),
                InlineButton::new("Cancel", *owner, CallbackAction::Cancel),
            ]);
            OutboundMessage {
                text: "Who should this task be assigned to?".to_owned(),
                keyboard: Some(keyboard),
            }
        }
        EngineReply::NoteParentPrompt { owner } => {
            let keyboard = InlineKeyboard::default()
                .row(vec![
                    InlineButton::new(
                        "List",
                        *owner,
                        CallbackAction::NoteParent { object: CrmObject::Lists },
                    ),
                    InlineButton::new(
                        "Company",
                        *owner,
                        CallbackAction::NoteParent { object: CrmObject::Companies },
                    ),
                    InlineButton::new(
                        "Person",
                        *owner,
                        CallbackAction::NoteParent { object: CrmObject::People },
                    ),
                ])
                .row(vec![InlineButton::new("Cancel", *owner, CallbackAction::Cancel)]);
            OutboundMessage {
                text: "Where should this note go — a list, a company, or a person?".to_owned(),
                keyboard: Some(keyboard),
            }
        }
        EngineReply::Report(report) => plain_message(report_text(report)),
        EngineReply::Failure { message } => plain_message(format!("⚠️ {message}")),
    }
}

fn summary_message(action: &SuggestedAction, owner: UserId, queued: usize) -> OutboundMessage {
    let mut lines = vec![format!("*{}*", action.intent.label())];

    let mut shown: Vec<&str> = Vec::new();
    for field in PRIORITY_FIELDS {
        if let Some(value) = action.field(field) {
            lines.push(format!("• {}: {value}", display_name(field)));
            shown.push(field);
        }
    }
    for (field, value) in &action.extracted {
        if shown.contains(&field.as_str())
            || HIDDEN_FIELDS.contains(&field.as_str())
            || field.ends_with("_candidates")
        {
            continue;
        }
        lines.push(format!("• {}: {value}", display_name(field)));
    }

    for prerequisite in &action.prerequisites {
        let name = prerequisite
            .extracted
            .get("name")
            .or_else(|| prerequisite.extracted.get("company"))
            .map(String::as_str)
            .unwrap_or("?");
        lines.push(format!("↳ will also {}: {name}", prerequisite.intent.label().to_lowercase()));
    }

    if !action.clarifications_needed.is_empty() {
        lines.push(format!(
            "{} open question{} skipped",
            action.clarifications_needed.len(),
            if action.clarifications_needed.len() == 1 { "" } else { "s" }
        ));
    }
    lines.push(format!(
        "{queued} forwarded message{} will be attached as a note.",
        if queued == 1 { "" } else { "s" }
    ));
    lines.push("Confirm?".to_owned());

    let mut edits: Vec<InlineButton> = shown
        .iter()
        .take(3)
        .map(|field| {
            InlineButton::new(
                format!("Edit {}", display_name(field)),
                owner,
                CallbackAction::Edit { field: (*field).to_owned() },
            )
        })
        .collect();
    if edits.is_empty() {
        edits.push(InlineButton::new(
            "Edit name",
            owner,
            CallbackAction::Edit { field: "name".to_owned() },
        ));
    }

    let keyboard = InlineKeyboard::default()
        .row(vec![
            InlineButton::new("✅ Confirm", owner, CallbackAction::Confirm),
            InlineButton::new("Cancel", owner, CallbackAction::Cancel),
        ])
        .row(edits);

    OutboundMessage { text: lines.join("\n"), keyboard: Some(keyboard) }
}

fn report_text(report: &ExecutionReport) -> String {
    let mut lines = Vec::new();
    let label = report.intent.label();
    if report.primary.url.is_empty() {
        lines.push(format!("✅ {label} done: {}", report.primary.name));
    } else {
        lines.push(format!("✅ {label} done: {} — {}", report.primary.name, report.primary.url));
    }
    for record in &report.also_created {
        if record.url.is_empty() {
            lines.push(format!("Also created {}: {}", record.object.singular(), record.name));
        } else {
            lines.push(format!(
                "Also created {}: {} — {}",
                record.object.singular(),
                record.name,
                record.url
            ));
        }
    }
    if report.note_id.is_some() {
        lines.push("The forwarded conversation was attached as a note.".to_owned());
    }
    lines.join("\n")
}

fn display_name(field: &str) -> String {
    let mut pretty = field.replace('_', " ");
    if let Some(first) = pretty.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    pretty
}

#[cfg(test)]
mod tests {
    use dossier_core::crm::CrmObject;
    use dossier_core::domain::action::{Clarification, Intent, SuggestedAction};
    use dossier_core::domain::ids::UserId;
    use dossier_core::executor::{ExecutionReport, RecordRef};
    use dossier_core::machine::EngineReply;

    use super::render_reply;

    const OWNER: UserId = UserId(42);

    #[test]
    fn summary_orders_priority_fields_first() {
        let mut action = SuggestedAction::new(Intent::CreatePerson);
        action.set_field("zzz_custom", "something");
        action.set_field("company", "Acme");
        action.set_field("name", "Jane Doe");

        let message = render_reply(&EngineReply::Summary { action, owner: OWNER, queued: 2 });

        let name_at = message.text.find("Name: Jane Doe").expect("name line");
        let company_at = message.text.find("Company: Acme").expect("company line");
        let custom_at = message.text.find("Zzz custom: something").expect("custom line");
        assert!(name_at < company_at && company_at < custom_at);
        assert!(message.text.contains("2 forwarded messages"));

        let keyboard = message.keyboard.expect("keyboard");
        assert_eq!(keyboard.rows[0][0].label, "✅ Confirm");
        assert_eq!(keyboard.rows[0][0].callback_data, "42|confirm");
    }

    #[test]
    fn summary_previews_prerequisites() {
        let mut action = SuggestedAction::new(Intent::CreatePerson);
        action.set_field("name", "Jane Doe");
        action.prerequisites.push(dossier_core::domain::action::PrerequisiteAction {
            intent: Intent::CreateCompany,
            extracted: [("name".to_owned(), "Acme".to_owned())].into_iter().collect(),
            reason: None,
        });

        let message = render_reply(&EngineReply::Summary { action, owner: OWNER, queued: 0 });
        assert!(message.text.contains("will also create company: Acme"));
    }

    #[test]
    fn question_options_become_buttons_with_escape_hatches() {
        let clarification = Clarification::with_options(
            "target_type",
            "Is \"vendors\" a list, a company, or a person?",
            vec!["List".to_owned(), "Company".to_owned(), "Person".to_owned()],
        );

        let message =
            render_reply(&EngineReply::Question { clarification, owner: OWNER });

        let keyboard = message.keyboard.expect("keyboard");
        let labels: Vec<&str> = keyboard
            .rows
            .iter()
            .flatten()
            .map(|button| button.label.as_str())
            .collect();
        assert!(labels.contains(&"List"));
        assert!(labels.contains(&"Other…"));
        assert!(labels.contains(&"Skip"));
        assert!(labels.contains(&"Cancel"));
        assert!(keyboard
            .rows
            .iter()
            .flatten()
            .any(|button| button.callback_data == "42|clarify:List"));
    }

    #[test]
    fn assignee_page_paginates_and_navigates() {
        let members: Vec<_> = (0..7)
            .map(|index| dossier_core::crm::WorkspaceMember {
                id: format!("member_{index}"),
                name: format!("Member {index}"),
            })
            .collect();

        let first = render_reply(&EngineReply::AssigneePage {
            page: 0,
            members: members.clone(),
            owner: OWNER,
        });
        let keyboard = first.keyboard.expect("keyboard");
        let labels: Vec<&str> =
            keyboard.rows.iter().flatten().map(|button| button.label.as_str()).collect();
        assert!(labels.contains(&"Member 0"));
        assert!(labels.contains(&"Member 4"));
        assert!(!labels.contains(&"Member 5"));
        assert!(labels.contains(&"Next ›"));
        assert!(!labels.contains(&"‹ Prev"));

        let second =
            render_reply(&EngineReply::AssigneePage { page: 1, members, owner: OWNER });
        let keyboard = second.keyboard.expect("keyboard");
        let labels: Vec<&str> =
            keyboard.rows.iter().flatten().map(|button| button.label.as_str()).collect();
        assert!(labels.contains(&"Member 5"));
        assert!(labels.contains(&"‹ Prev"));
        assert!(!labels.contains(&"Next ›"));
    }

    #[test]
    fn report_lists_also_created_records() {
        let report = ExecutionReport {
            intent: Intent::CreatePerson,
            primary: RecordRef {
                object: CrmObject::People,
                id: "person_1".to_owned(),
                url: "https://crm.example/people/person_1".to_owned(),
                name: "Jane Doe".to_owned(),
            },
            also_created: vec![RecordRef {
                object: CrmObject::Companies,
                id: "company_1".to_owned(),
                url: "https://crm.example/companies/company_1".to_owned(),
                name: "Acme".to_owned(),
            }],
            note_id: Some("note_1".to_owned()),
        };

        let message = render_reply(&EngineReply::Report(report));
        assert!(message.text.contains("Create person done: Jane Doe"));
        assert!(message.text.contains("Also created company: Acme"));
        assert!(message.text.contains("attached as a note"));
        assert!(message.keyboard.is_none());
    }
}
