//! Classifier implementations for the conversation engine.
//!
//! The engine consumes the `Classifier` trait from `dossier-core`; this
//! crate provides the two implementations:
//!
//! - `LlmClassifier` — prompts a pluggable `LlmClient` for JSON-mode
//!   analysis and clarification processing.
//! - `KeywordClassifier` — a deterministic keyword fallback used when no
//!   LLM is configured, and as a predictable stand-in for smoke tests.
//!
//! # Safety principle
//!
//! The classifier is strictly a translator. It never mutates CRM state and
//! never decides what gets committed — the human confirmation step and the
//! deterministic executor own those decisions.

pub mod fallback;
pub mod llm;

pub use fallback::KeywordClassifier;
pub use llm::{LlmClassifier, LlmClient};
