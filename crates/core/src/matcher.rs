//! Fuzzy resolution of a free-text company/person/list reference against
//! registry search results. Pure scoring over the top candidate; the rules
//! run in order and the first hit wins.
//!
//! The ambiguity cap demotes a strong textual match to `Medium` when the
//! search returned more than [`AMBIGUOUS_CANDIDATE_THRESHOLD`] candidates:
//! the same match among many hits is less trustworthy than when it is the
//! only hit. The cap only ever demotes.

use serde::{Deserialize, Serialize};

use crate::crm::SearchResult;

/// Result sets larger than this are treated as ambiguous.
pub const AMBIGUOUS_CANDIDATE_THRESHOLD: usize = 3;

/// Corporate suffix vocabulary stripped during name comparison.
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc", "llc", "corp", "corporation", "ltd", "limited", "co", "company", "labs",
    "technologies", "solutions", "group", "holdings", "partners", "ventures", "capital",
    "gmbh", "ag", "sa", "pty", "plc",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    High,
    Medium,
    Low,
    None,
}

impl std::fmt::Display for MatchConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        };
        f.write_str(label)
    }
}

/// Derived per query, never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchConfidenceResult {
    pub confidence: MatchConfidence,
    pub reason: String,
}

impl MatchConfidenceResult {
    fn new(confidence: MatchConfidence, reason: impl Into<String>) -> Self {
        Self { confidence, reason: reason.into() }
    }

    pub fn is_high(&self) -> bool {
        self.confidence == MatchConfidence::High
    }
}

/// Score the top candidate against the free-text reference.
pub fn match_reference(
    input: &str,
    domain_hint: Option<&str>,
    candidates: &[SearchResult],
) -> MatchConfidenceResult {
    let Some(top) = candidates.first() else {
        return MatchConfidenceResult::new(MatchConfidence::None, "No candidates found");
    };
    let ambiguous = candidates.len() > AMBIGUOUS_CANDIDATE_THRESHOLD;

    let raw = normalize(input);
    let parsed = parse_reference(input, domain_hint);
    let parsed_name = normalize(&parsed.name);
    let candidate = normalize(&top.name);

    // Rule 1: exact equality of raw input or parsed name.
    if !raw.is_empty() && (raw == candidate || parsed_name == candidate) {
        return MatchConfidenceResult::new(MatchConfidence::High, "Exact match");
    }

    // Rule 2: equality after corporate-suffix stripping on both sides.
    let (stripped_input, input_had_suffix) = strip_suffixes(&parsed_name);
    let (stripped_candidate, _) = strip_suffixes(&candidate);
    if !stripped_input.is_empty() && stripped_input == stripped_candidate {
        if input_had_suffix {
            return MatchConfidenceResult::new(
                MatchConfidence::High,
                "Exact match (ignoring suffixes)",
            );
        }
        return capped(ambiguous, "Exact match (ignoring suffixes)");
    }

    // Rule 3: domain equality / containment against the candidate's
    // secondary field.
    if let (Some(input_domain), Some(extra)) = (&parsed.domain, &top.extra) {
        let input_domain = normalize(input_domain);
        let extra = normalize(extra);
        if !input_domain.is_empty() {
            if input_domain == extra {
                return MatchConfidenceResult::new(MatchConfidence::High, "Domain match");
            }
            if extra.contains(&input_domain) || input_domain.contains(&extra) {
                return MatchConfidenceResult::new(MatchConfidence::Medium, "Partial domain match");
            }
        }
    }

    // Rule 4: sequential prefix covering at least 90% of the input.
    let input_chars = stripped_input.chars().count();
    if input_chars > 0 {
        let prefix = common_prefix_chars(&stripped_input, &stripped_candidate);
        if prefix as f64 >= 0.9 * input_chars as f64 {
            return capped(ambiguous, "Strong prefix match");
        }
    }

    // Rule 5: best single-word match.
    let best_word = best_word_score(&stripped_input, &stripped_candidate);
    if best_word >= 0.9 {
        return capped(ambiguous, "Strong word match");
    }
    if best_word >= 0.7 {
        return MatchConfidenceResult::new(MatchConfidence::Medium, "Partial word match");
    }

    // Rule 6: substring containment either direction.
    if !stripped_input.is_empty() && stripped_candidate.contains(&stripped_input) {
        let remainder = stripped_candidate.chars().count().saturating_sub(input_chars);
        if remainder < input_chars {
            return capped(ambiguous, "Name contains query");
        }
        return MatchConfidenceResult::new(MatchConfidence::Medium, "Name contains query");
    }
    if !stripped_candidate.is_empty() && stripped_input.contains(&stripped_candidate) {
        return MatchConfidenceResult::new(MatchConfidence::Medium, "Query contains name");
    }

    // Rule 7: aggregate word overlap.
    let overlap = word_overlap_ratio(&stripped_input, &stripped_candidate);
    if overlap >= 0.8 {
        return capped(ambiguous, "High word overlap");
    }
    if overlap >= 0.5 {
        return MatchConfidenceResult::new(MatchConfidence::Medium, "Partial word overlap");
    }

    // Rule 8: weak signals only.
    let length_overlap = char_length_overlap(&stripped_input, &stripped_candidate);
    if length_overlap > 0.8 {
        return MatchConfidenceResult::new(MatchConfidence::Medium, "Similar name length");
    }
    let multiple = candidates.len() > 1;
    if multiple {
        if name_prefix_match(&stripped_input, &stripped_candidate) {
            return MatchConfidenceResult::new(
                MatchConfidence::Medium,
                "Prefix similarity among multiple candidates",
            );
        }
        return MatchConfidenceResult::new(MatchConfidence::Low, "Ambiguous, no clear match");
    }
    if length_overlap > 0.5 {
        return MatchConfidenceResult::new(MatchConfidence::Low, "Weak partial overlap");
    }
    MatchConfidenceResult::new(MatchConfidence::Low, "Weak match, first result taken")
}

struct ParsedReference {
    name: String,
    domain: Option<String>,
}

/// Split a free-text reference into a name part and an optional domain.
/// An explicit hint wins; otherwise the first dotted token is treated as
/// the domain and removed from the name.
fn parse_reference(input: &str, domain_hint: Option<&str>) -> ParsedReference {
    let mut domain = domain_hint.map(str::to_owned);
    let mut name_tokens = Vec::new();

    for token in input.split_whitespace() {
        let bare = token.trim_matches(|ch: char| "()[],".contains(ch));
        if domain.is_none() && looks_like_domain(bare) {
            domain = Some(bare.to_owned());
            continue;
        }
        name_tokens.push(bare);
    }

    let name = if name_tokens.is_empty() { input.to_owned() } else { name_tokens.join(" ") };
    ParsedReference { name, domain }
}

fn looks_like_domain(token: &str) -> bool {
    token.len() > 3
        && token.contains('.')
        && !token.starts_with('.')
        && !token.ends_with('.')
        && !token.contains('@')
        && token.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-')
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|ch: char| !ch.is_alphanumeric()))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Remove trailing corporate suffix words. Returns the stripped name and
/// whether anything was actually removed.
fn strip_suffixes(name: &str) -> (String, bool) {
    let mut words: Vec<&str> = name.split_whitespace().collect();
    let mut stripped = false;
    while words.len() > 1 {
        let last = words[words.len() - 1];
        if CORPORATE_SUFFIXES.contains(&last) {
            words.pop();
            stripped = true;
        } else {
            break;
        }
    }
    (words.join(" "), stripped)
}

fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Best single-word signal, weighted by how much of the input the matched
/// word covers. A lone-word input can reach 1.0; in a multi-word input a
/// single shared word only counts for its share, leaving the aggregate
/// overlap rule to judge the rest.
fn best_word_score(input: &str, candidate: &str) -> f64 {
    let total_chars = input.chars().filter(|ch| !ch.is_whitespace()).count();
    if total_chars == 0 {
        return 0.0;
    }
    let mut best: f64 = 0.0;
    for input_word in input.split_whitespace() {
        let coverage = input_word.chars().count() as f64 / total_chars as f64;
        for candidate_word in candidate.split_whitespace() {
            let score = word_score(input_word, candidate_word) * coverage;
            best = best.max(score);
        }
    }
    best
}

fn word_score(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (shorter, longer) =
        if a.chars().count() <= b.chars().count() { (a, b) } else { (b, a) };
    if longer.starts_with(shorter) && !shorter.is_empty() {
        return shorter.chars().count() as f64 / longer.chars().count() as f64;
    }
    0.0
}

fn word_overlap_ratio(input: &str, candidate: &str) -> f64 {
    let input_words: Vec<&str> = input.split_whitespace().collect();
    if input_words.is_empty() {
        return 0.0;
    }
    let candidate_words: std::collections::HashSet<&str> =
        candidate.split_whitespace().collect();
    let shared = input_words.iter().filter(|word| candidate_words.contains(*word)).count();
    shared as f64 / input_words.len() as f64
}

fn char_length_overlap(input: &str, candidate: &str) -> f64 {
    let a = input.chars().count();
    let b = candidate.chars().count();
    if a == 0 || b == 0 {
        return 0.0;
    }
    a.min(b) as f64 / a.max(b) as f64
}

fn name_prefix_match(input: &str, candidate: &str) -> bool {
    match (input.split_whitespace().next(), candidate.split_whitespace().next()) {
        (Some(a), Some(b)) => a == b || b.starts_with(a) || a.starts_with(b),
        _ => false,
    }
}

/// Ambiguity cap: a `High` signal demotes to `Medium` when the result set
/// is large. Never promotes.
fn capped(ambiguous: bool, reason: &str) -> MatchConfidenceResult {
    if ambiguous {
        MatchConfidenceResult::new(
            MatchConfidence::Medium,
            format!("{reason} (multiple candidates)"),
        )
    } else {
        MatchConfidenceResult::new(MatchConfidence::High, reason)
    }
}
