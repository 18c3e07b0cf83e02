//! HTTP client for an Attio-style CRM REST API, implementing the registry
//! search and record mutation contracts. Non-success responses surface the
//! API's own error body verbatim in `CrmError::Rejected`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use dossier_core::crm::{
    CreatedRecord, CrmError, CrmObject, RecordMutator, Registry, SearchResult, WorkspaceMember,
};

pub struct HttpCrmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpCrmClient {
    pub fn new(base_url: String, api_key: SecretString, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.trim_end_matches('/').to_owned(), api_key }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, CrmError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(self.api_key.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| CrmError::Transport(error.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| CrmError::Transport(error.to_string()))?;

        if !status.is_success() {
            return Err(CrmError::Rejected(error_message(&text, status.as_u16())));
        }
        debug!(event_name = "crm.request_ok", path, status = status.as_u16(), "crm call succeeded");
        serde_json::from_str(&text).map_err(|error| CrmError::Transport(error.to_string()))
    }
}

#[async_trait]
impl Registry for HttpCrmClient {
    async fn search_records(
        &self,
        object: CrmObject,
        query: &str,
    ) -> Result<Vec<SearchResult>, CrmError> {
        let body = json!({
            "filter": { "name": { "$contains": query } },
            "limit": 10,
        });
        let payload = self
            .request(
                reqwest::Method::POST,
                &format!("/v2/objects/{}/records/query", object.as_str()),
                Some(body),
            )
            .await?;
        Ok(parse_search_results(&payload))
    }

    async fn list_workspace_members(&self) -> Result<Vec<WorkspaceMember>, CrmError> {
        let payload =
            self.request(reqwest::Method::GET, "/v2/workspace_members", None).await?;
        Ok(parse_workspace_members(&payload))
    }

    async fn object_schema(&self, object: CrmObject) -> Result<Value, CrmError> {
        self.request(
            reqwest::Method::GET,
            &format!("/v2/objects/{}/attributes", object.as_str()),
            None,
        )
        .await
    }
}

#[async_trait]
impl RecordMutator for HttpCrmClient {
    async fn create_record(
        &self,
        object: CrmObject,
        fields: &BTreeMap<String, String>,
    ) -> Result<CreatedRecord, CrmError> {
        let values: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        let payload = self
            .request(
                reqwest::Method::POST,
                &format!("/v2/objects/{}/records", object.as_str()),
                Some(json!({ "data": { "values": values } })),
            )
            .await?;
        parse_created_record(&payload, object)
            .ok_or_else(|| CrmError::Rejected("record create returned no id".to_owned()))
    }

    async fn create_note(
        &self,
        parent: CrmObject,
        parent_id: &str,
        title: &str,
        content: &str,
    ) -> Result<String, CrmError> {
        let payload = self
            .request(
                reqwest::Method::POST,
                "/v2/notes",
                Some(json!({
                    "data": {
                        "parent_object": parent.as_str(),
                        "parent_record_id": parent_id,
                        "title": title,
                        "format": "plaintext",
                        "content": content,
                    }
                })),
            )
            .await?;
        payload
            .pointer("/data/id/note_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CrmError::Rejected("note create returned no id".to_owned()))
    }

    async fn add_to_list(&self, list_id: &str, record_id: &str) -> Result<String, CrmError> {
        let payload = self
            .request(
                reqwest::Method::POST,
                &format!("/v2/lists/{list_id}/entries"),
                Some(json!({
                    "data": {
                        "parent_record_id": record_id,
                    }
                })),
            )
            .await?;
        payload
            .pointer("/data/id/entry_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CrmError::Rejected("list entry create returned no id".to_owned()))
    }
}

fn error_message(body: &str, status: u16) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|value| value.get("message").or_else(|| value.get("error")))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("http {status}: {body}"))
}

fn parse_search_results(payload: &Value) -> Vec<SearchResult> {
    let Some(rows) = payload.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let id = row.pointer("/id/record_id").and_then(Value::as_str)?;
            let name = row
                .pointer("/values/name/0/value")
                .and_then(Value::as_str)
                .unwrap_or("(unnamed)");
            let extra = row
                .pointer("/values/domains/0/domain")
                .or_else(|| row.pointer("/values/email_addresses/0/email_address"))
                .and_then(Value::as_str)
                .map(str::to_owned);
            Some(SearchResult { id: id.to_owned(), name: name.to_owned(), extra })
        })
        .collect()
}

fn parse_workspace_members(payload: &Value) -> Vec<WorkspaceMember> {
    let Some(rows) = payload.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let id = row.pointer("/id/workspace_member_id").and_then(Value::as_str)?;
            let first = row.get("first_name").and_then(Value::as_str).unwrap_or("");
            let last = row.get("last_name").and_then(Value::as_str).unwrap_or("");
            let name = format!("{first} {last}").trim().to_owned();
            Some(WorkspaceMember { id: id.to_owned(), name })
        })
        .collect()
}

fn parse_created_record(payload: &Value, object: CrmObject) -> Option<CreatedRecord> {
    let id = payload.pointer("/data/id/record_id").and_then(Value::as_str)?;
    let url = payload
        .pointer("/data/web_url")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("https://app.attio.com/objects/{}/{id}", object.as_str()));
    Some(CreatedRecord { id: id.to_owned(), url })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use dossier_core::crm::CrmObject;

    use super::{error_message, parse_created_record, parse_search_results, parse_workspace_members};

    #[test]
    fn search_results_carry_domain_as_secondary_field() {
        let payload = json!({
            "data": [
                {
                    "id": {"record_id": "rec_1"},
                    "values": {
                        "name": [{"value": "Acme Corp"}],
                        "domains": [{"domain": "acme.com"}]
                    }
                },
                {
                    "id": {"record_id": "rec_2"},
                    "values": {"name": [{"value": "Acme Labs"}]}
                }
            ]
        });

        let results = parse_search_results(&payload);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "rec_1");
        assert_eq!(results[0].name, "Acme Corp");
        assert_eq!(results[0].extra.as_deref(), Some("acme.com"));
        assert!(results[1].extra.is_none());
    }

    #[test]
    fn created_record_falls_back_to_app_url() {
        let payload = json!({"data": {"id": {"record_id": "rec_9"}}});
        let record = parse_created_record(&payload, CrmObject::People).expect("record");
        assert_eq!(record.id, "rec_9");
        assert!(record.url.contains("/people/rec_9"));
    }

    #[test]
    fn workspace_members_join_first_and_last_name() {
        let payload = json!({
            "data": [
                {"id": {"workspace_member_id": "member_1"}, "first_name": "Sam", "last_name": "Ortiz"}
            ]
        });
        let members = parse_workspace_members(&payload);
        assert_eq!(members[0].name, "Sam Ortiz");
    }

    #[test]
    fn error_body_message_is_surfaced_verbatim() {
        let message = error_message(r#"{"message": "duplicate domain"}"#, 409);
        assert_eq!(message, "duplicate domain");

        let fallback = error_message("gateway timeout", 504);
        assert!(fallback.contains("504"));
    }
}
