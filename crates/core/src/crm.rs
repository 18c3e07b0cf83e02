//! Contracts for the CRM collaborators: read-only registry search and
//! record mutation. Implemented over HTTP in `dossier-crm`; the in-memory
//! fake here backs the engine and executor tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CRM object namespaces the engine can address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmObject {
    Companies,
    People,
    Deals,
    Tasks,
    Lists,
}

impl CrmObject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Companies => "companies",
            Self::People => "people",
            Self::Deals => "deals",
            Self::Tasks => "tasks",
            Self::Lists => "lists",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "companies" | "company" => Some(Self::Companies),
            "people" | "person" => Some(Self::People),
            "deals" | "deal" => Some(Self::Deals),
            "tasks" | "task" => Some(Self::Tasks),
            "lists" | "list" => Some(Self::Lists),
            _ => None,
        }
    }

    pub fn singular(&self) -> &'static str {
        match self {
            Self::Companies => "company",
            Self::People => "person",
            Self::Deals => "deal",
            Self::Tasks => "task",
            Self::Lists => "list",
        }
    }
}

impl std::fmt::Display for CrmObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry search hit. `extra` carries a secondary disambiguator such
/// as a company domain or an email address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), extra: None }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub id: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CrmError {
    #[error("crm transport failure: {0}")]
    Transport(String),
    #[error("crm rejected the request: {0}")]
    Rejected(String),
}

/// Read-only search surface. Must be idempotent and side-effect-free;
/// result ordering is the collaborator's own relevance order.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn search_records(
        &self,
        object: CrmObject,
        query: &str,
    ) -> Result<Vec<SearchResult>, CrmError>;

    async fn list_workspace_members(&self) -> Result<Vec<WorkspaceMember>, CrmError>;

    async fn object_schema(&self, object: CrmObject) -> Result<serde_json::Value, CrmError>;
}

/// Record mutation surface. Any non-success is surfaced as a `CrmError`
/// carrying the raw collaborator message.
#[async_trait]
pub trait RecordMutator: Send + Sync {
    async fn create_record(
        &self,
        object: CrmObject,
        fields: &BTreeMap<String, String>,
    ) -> Result<CreatedRecord, CrmError>;

    async fn create_note(
        &self,
        parent: CrmObject,
        parent_id: &str,
        title: &str,
        content: &str,
    ) -> Result<String, CrmError>;

    async fn add_to_list(&self, list_id: &str, record_id: &str)
        -> Result<String, CrmError>;
}

/// Scriptable in-memory CRM used by engine/executor tests. Search results
/// are seeded per (object, query); mutations are recorded for assertion and
/// can be forced to fail per object.
#[derive(Default)]
pub struct InMemoryCrm {
    state: tokio::sync::Mutex<InMemoryCrmState>,
}

#[derive(Default)]
struct InMemoryCrmState {
    search_results: std::collections::HashMap<(CrmObject, String), Vec<SearchResult>>,
    members: Vec<WorkspaceMember>,
    created: Vec<(CrmObject, BTreeMap<String, String>)>,
    notes: Vec<(CrmObject, String, String, String)>,
    list_entries: Vec<(String, String)>,
    fail_create: std::collections::HashMap<CrmObject, String>,
    next_id: u64,
}

impl InMemoryCrm {
    pub async fn seed_search(&self, object: CrmObject, query: &str, results: Vec<SearchResult>) {
        let mut state = self.state.lock().await;
        state.search_results.insert((object, query.to_ascii_lowercase()), results);
    }

    pub async fn seed_members(&self, members: Vec<WorkspaceMember>) {
        self.state.lock().await.members = members;
    }

    pub async fn fail_create(&self, object: CrmObject, message: &str) {
        self.state.lock().await.fail_create.insert(object, message.to_owned());
    }

    pub async fn created_records(&self) -> Vec<(CrmObject, BTreeMap<String, String>)> {
        self.state.lock().await.created.clone()
    }

    pub async fn notes(&self) -> Vec<(CrmObject, String, String, String)> {
        self.state.lock().await.notes.clone()
    }

    pub async fn list_entries(&self) -> Vec<(String, String)> {
        self.state.lock().await.list_entries.clone()
    }
}

#[async_trait]
impl Registry for InMemoryCrm {
    async fn search_records(
        &self,
        object: CrmObject,
        query: &str,
    ) -> Result<Vec<SearchResult>, CrmError> {
        let state = self.state.lock().await;
        Ok(state
            .search_results
            .get(&(object, query.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_workspace_members(&self) -> Result<Vec<WorkspaceMember>, CrmError> {
        Ok(self.state.lock().await.members.clone())
    }

    async fn object_schema(&self, _object: CrmObject) -> Result<serde_json::Value, CrmError> {
        Ok(serde_json::json!({ "attributes": [] }))
    }
}

#[async_trait]
impl RecordMutator for InMemoryCrm {
    async fn create_record(
        &self,
        object: CrmObject,
        fields: &BTreeMap<String, String>,
    ) -> Result<CreatedRecord, CrmError> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.fail_create.get(&object) {
            return Err(CrmError::Rejected(message.clone()));
        }
        state.next_id += 1;
        let id = format!("rec_{}", state.next_id);
        state.created.push((object, fields.clone()));
        Ok(CreatedRecord { url: format!("https://crm.example/{object}/{id}"), id })
    }

    async fn create_note(
        &self,
        parent: CrmObject,
        parent_id: &str,
        title: &str,
        content: &str,
    ) -> Result<String, CrmError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("note_{}", state.next_id);
        state.notes.push((parent, parent_id.to_owned(), title.to_owned(), content.to_owned()));
        Ok(id)
    }

    async fn add_to_list(&self, list_id: &str, record_id: &str) -> Result<String, CrmError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("entry_{}", state.next_id);
        state.list_entries.push((list_id.to_owned(), record_id.to_owned()));
        Ok(id)
    }
}
