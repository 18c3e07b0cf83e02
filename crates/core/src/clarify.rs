//! Clarification-loop stepping. The question list is snapshotted when the
//! loop starts; `index` walks that snapshot even though each answer may
//! grow or shrink the action's own clarification list.

use crate::domain::action::{Clarification, SuggestedAction};

/// Callback value a user presses to answer the current question with free
/// text instead of one of the offered options.
pub const FREE_TEXT_SENTINEL: &str = "__other__";

/// Where the loop goes after one answer has been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClarifyOutcome {
    /// Present `questions[next_index]` from the original snapshot.
    AskNext { next_index: usize },
    /// No more questions to walk: hand the action to confirmation.
    Confirm,
}

/// Continue-condition: keep walking while the updated action still has
/// clarifications AND entries remain in the snapshot; otherwise exit to
/// confirmation.
pub fn next_step(
    updated: &SuggestedAction,
    snapshot: &[Clarification],
    index: usize,
) -> ClarifyOutcome {
    let next_index = index + 1;
    if updated.has_clarifications() && next_index < snapshot.len() {
        ClarifyOutcome::AskNext { next_index }
    } else {
        ClarifyOutcome::Confirm
    }
}

/// The question currently being asked, if the index is still within the
/// snapshot. An out-of-range index means the snapshot was exhausted.
pub fn current_question(snapshot: &[Clarification], index: usize) -> Option<&Clarification> {
    snapshot.get(index)
}

/// Skip: discard every remaining question, keeping already-extracted
/// values untouched.
pub fn skip_remaining(action: &mut SuggestedAction) {
    action.clarifications_needed.clear();
}
