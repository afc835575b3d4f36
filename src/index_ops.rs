//! Index operations: one method per remote verb.
//!
//! [`SearchService`] is the seam between the engine and the remote search
//! service. [`IndexClient`] implements it over [`TransportClient`] with
//! fixed path templates and typed response decoding; the in-memory
//! implementation lives in [`crate::memory`].
//!
//! All methods take their resource identifiers from the caller, so each
//! call is idempotent at the resource level and safe to retry. Errors are
//! the transport's, relabelled with the verb and resource id.
//!
//! # Operations
//!
//! | Area | Methods |
//! |------|---------|
//! | Indexes | `get_index`, `list_indexes`, `create_or_update_index`, `delete_index`, `index_statistics` |
//! | Documents | `upload_documents`, `delete_documents`, `get_document`, `count_documents`, `search_keys` |
//! | Indexers | `create_or_update_indexer`, `run_indexer`, `reset_indexer`, `indexer_status`, `delete_indexer` |
//! | Data sources | `create_or_update_data_source`, `get_data_source`, `delete_data_source` |
//! | Skillsets | `create_or_update_skillset`, `get_skillset`, `delete_skillset` |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::error::{IndexError, Result};
use crate::models::{Document, DocumentOutcome, ID_FIELD};
use crate::schema::SchemaDefinition;
use crate::transport::{Method, Response, TransportClient};

/// Largest `$top` the service accepts for a key listing.
pub const KEY_PAGE_SIZE: usize = 1000;

/// Storage statistics for one index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatistics {
    pub document_count: u64,
    pub storage_size: u64,
    #[serde(default)]
    pub vector_index_size: u64,
}

/// Per-key result of a document upload or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingResult {
    pub key: String,
    pub status: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub status_code: u16,
}

impl IndexingResult {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: true,
            error_message: None,
            status_code: 200,
        }
    }

    pub fn failed(key: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: false,
            error_message: Some(message.into()),
            status_code,
        }
    }

    pub fn into_outcome(self) -> DocumentOutcome {
        if self.status {
            DocumentOutcome::success(self.key)
        } else {
            let reason = self
                .error_message
                .unwrap_or_else(|| format!("rejected with status {}", self.status_code));
            DocumentOutcome::failure(self.key, reason)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerExecution {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub item_count: u64,
    #[serde(default)]
    pub failed_item_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub last_result: Option<IndexerExecution>,
}

/// Remote search service verbs used by the engine.
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Fetch the live definition, or `None` if the index does not exist.
    async fn get_index(&self, name: &str) -> Result<Option<SchemaDefinition>>;
    async fn list_indexes(&self) -> Result<Vec<String>>;
    async fn create_or_update_index(&self, schema: &SchemaDefinition) -> Result<()>;
    /// Returns `false` if there was nothing to delete.
    async fn delete_index(&self, name: &str) -> Result<bool>;
    async fn index_statistics(&self, name: &str) -> Result<IndexStatistics>;

    /// `mergeOrUpload` every document. One result per key.
    async fn upload_documents(&self, index: &str, docs: &[Document]) -> Result<Vec<IndexingResult>>;
    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<Vec<IndexingResult>>;
    async fn get_document(&self, index: &str, key: &str) -> Result<Option<Value>>;
    async fn count_documents(&self, index: &str) -> Result<u64>;
    /// Keys of documents matching an OData `filter`, one page at a time.
    async fn search_keys(&self, index: &str, filter: &str, top: usize, skip: usize) -> Result<Vec<String>>;

    async fn create_or_update_indexer(&self, name: &str, definition: &Value) -> Result<()>;
    async fn run_indexer(&self, name: &str) -> Result<()>;
    async fn reset_indexer(&self, name: &str) -> Result<()>;
    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus>;
    async fn delete_indexer(&self, name: &str) -> Result<bool>;

    async fn create_or_update_data_source(&self, name: &str, definition: &Value) -> Result<()>;
    async fn get_data_source(&self, name: &str) -> Result<Option<Value>>;
    async fn delete_data_source(&self, name: &str) -> Result<bool>;

    async fn create_or_update_skillset(&self, name: &str, definition: &Value) -> Result<()>;
    async fn get_skillset(&self, name: &str) -> Result<Option<Value>>;
    async fn delete_skillset(&self, name: &str) -> Result<bool>;
}

/// Delete every document matching `filter`, one page of keys per round.
///
/// Each round lists from the top of the result set and deletes what it
/// got, so the listing never pages deep enough to hit the service's skip
/// limit. Keys that fail to delete still match and are skipped over in
/// later rounds. A page holding only keys already handled ends the loop.
/// Returns one result per key attempted.
pub async fn delete_matching(
    service: &dyn SearchService,
    index: &str,
    filter: &str,
    page_size: usize,
) -> Result<Vec<IndexingResult>> {
    let page_size = page_size.clamp(1, KEY_PAGE_SIZE);
    let mut handled = HashSet::new();
    let mut failed = 0;
    let mut results = Vec::new();
    loop {
        let page = service.search_keys(index, filter, page_size, failed).await?;
        let fresh: Vec<String> = page.into_iter().filter(|k| !handled.contains(k)).collect();
        if fresh.is_empty() {
            return Ok(results);
        }
        handled.extend(fresh.iter().cloned());
        let round = service.delete_documents(index, &fresh).await?;
        failed += round.iter().filter(|r| !r.status).count();
        results.extend(round);
    }
}

/// HTTP implementation of [`SearchService`].
#[derive(Debug, Clone)]
pub struct IndexClient {
    transport: TransportClient,
}

impl IndexClient {
    pub fn new(transport: TransportClient) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        label: impl Into<String>,
    ) -> Result<Response> {
        self.transport
            .request(method, path, body)
            .await
            .map_err(|e| e.annotate(label))
    }

    /// Like [`call`](Self::call), but a 404 becomes `Ok(None)`.
    async fn call_optional(
        &self,
        method: Method,
        path: &str,
        label: String,
    ) -> Result<Option<Response>> {
        match self.call(method, path, None, label).await {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_definition(&self, kind: &str, name: &str, definition: &Value, verb: &str) -> Result<()> {
        let mut body = definition.clone();
        if let Value::Object(ref mut map) = body {
            map.insert("name".to_string(), json!(name));
        }
        self.call(
            Method::Put,
            &format!("/{}/{}", kind, encode_segment(name)),
            Some(&body),
            format!("{}({})", verb, name),
        )
        .await?;
        Ok(())
    }

    async fn get_definition(&self, kind: &str, name: &str, verb: &str) -> Result<Option<Value>> {
        let label = format!("{}({})", verb, name);
        match self
            .call_optional(Method::Get, &format!("/{}/{}", kind, encode_segment(name)), label.clone())
            .await?
        {
            Some(resp) => resp.decode(&label).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_resource(&self, kind: &str, name: &str, verb: &str) -> Result<bool> {
        let label = format!("{}({})", verb, name);
        Ok(self
            .call_optional(Method::Delete, &format!("/{}/{}", kind, encode_segment(name)), label)
            .await?
            .is_some())
    }

    async fn index_batch(&self, index: &str, actions: Vec<Value>, verb: &str) -> Result<Vec<IndexingResult>> {
        #[derive(Deserialize)]
        struct BatchResponse {
            value: Vec<IndexingResult>,
        }

        let label = format!("{}({}, {} docs)", verb, index, actions.len());
        let body = json!({ "value": actions });
        let resp = self
            .call(
                Method::Post,
                &format!("/indexes/{}/docs/index", encode_segment(index)),
                Some(&body),
                label.clone(),
            )
            .await?;
        let parsed: BatchResponse = resp.decode(&label)?;
        Ok(parsed.value)
    }
}

#[async_trait]
impl SearchService for IndexClient {
    async fn get_index(&self, name: &str) -> Result<Option<SchemaDefinition>> {
        let label = format!("get_index({})", name);
        match self
            .call_optional(Method::Get, &format!("/indexes/{}", encode_segment(name)), label.clone())
            .await?
        {
            Some(resp) => resp.decode(&label).map(Some),
            None => Ok(None),
        }
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Named {
            name: String,
        }
        #[derive(Deserialize)]
        struct ListResponse {
            value: Vec<Named>,
        }

        let resp = self
            .call(Method::Get, "/indexes?$select=name", None, "list_indexes")
            .await?;
        let parsed: ListResponse = resp.decode("list_indexes")?;
        Ok(parsed.value.into_iter().map(|n| n.name).collect())
    }

    async fn create_or_update_index(&self, schema: &SchemaDefinition) -> Result<()> {
        let label = format!("create_or_update_index({})", schema.name);
        let body = serde_json::to_value(schema).map_err(|e| IndexError::Decode {
            operation: label.clone(),
            message: e.to_string(),
        })?;
        self.call(
            Method::Put,
            &format!("/indexes/{}", encode_segment(&schema.name)),
            Some(&body),
            label,
        )
        .await?;
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<bool> {
        self.delete_resource("indexes", name, "delete_index").await
    }

    async fn index_statistics(&self, name: &str) -> Result<IndexStatistics> {
        let label = format!("index_statistics({})", name);
        self.call(
            Method::Get,
            &format!("/indexes/{}/stats", encode_segment(name)),
            None,
            label.clone(),
        )
        .await?
        .decode(&label)
    }

    async fn upload_documents(&self, index: &str, docs: &[Document]) -> Result<Vec<IndexingResult>> {
        let actions = docs
            .iter()
            .map(|doc| {
                let mut value = doc.to_index_json();
                if let Value::Object(ref mut map) = value {
                    map.insert("@search.action".to_string(), json!("mergeOrUpload"));
                }
                value
            })
            .collect();
        self.index_batch(index, actions, "upload_documents").await
    }

    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<Vec<IndexingResult>> {
        let actions = keys
            .iter()
            .map(|key| json!({ "@search.action": "delete", ID_FIELD: key }))
            .collect();
        self.index_batch(index, actions, "delete_documents").await
    }

    async fn get_document(&self, index: &str, key: &str) -> Result<Option<Value>> {
        let label = format!("get_document({}, {})", index, key);
        let path = format!(
            "/indexes/{}/docs/{}",
            encode_segment(index),
            encode_segment(key)
        );
        match self.call_optional(Method::Get, &path, label.clone()).await? {
            Some(resp) => resp.decode(&label).map(Some),
            None => Ok(None),
        }
    }

    async fn count_documents(&self, index: &str) -> Result<u64> {
        let label = format!("count_documents({})", index);
        let resp = self
            .call(
                Method::Get,
                &format!("/indexes/{}/docs/$count", encode_segment(index)),
                None,
                label.clone(),
            )
            .await?;
        // The count endpoint answers in plain text.
        let count = match resp {
            Response::Body { value: Value::Number(n), .. } => n.as_u64(),
            Response::Body { value: Value::String(s), .. } => s.trim().parse().ok(),
            _ => None,
        };
        count.ok_or_else(|| IndexError::Decode {
            operation: label,
            message: "count is not a number".to_string(),
        })
    }

    async fn search_keys(&self, index: &str, filter: &str, top: usize, skip: usize) -> Result<Vec<String>> {
        let label = format!("search_keys({}, {})", index, filter);
        let body = json!({
            "search": "*",
            "filter": filter,
            "select": ID_FIELD,
            "top": top,
            "skip": skip,
        });
        let resp = self
            .call(
                Method::Post,
                &format!("/indexes/{}/docs/search", encode_segment(index)),
                Some(&body),
                label.clone(),
            )
            .await?;
        let parsed: Value = resp.decode(&label)?;
        let hits = parsed
            .get("value")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IndexError::Decode {
                operation: label.clone(),
                message: "missing value array".to_string(),
            })?;
        Ok(hits
            .iter()
            .filter_map(|hit| hit.get(ID_FIELD).and_then(|k| k.as_str()).map(String::from))
            .collect())
    }

    async fn create_or_update_indexer(&self, name: &str, definition: &Value) -> Result<()> {
        self.put_definition("indexers", name, definition, "create_or_update_indexer")
            .await
    }

    async fn run_indexer(&self, name: &str) -> Result<()> {
        self.call(
            Method::Post,
            &format!("/indexers/{}/run", encode_segment(name)),
            None,
            format!("run_indexer({})", name),
        )
        .await?;
        Ok(())
    }

    async fn reset_indexer(&self, name: &str) -> Result<()> {
        self.call(
            Method::Post,
            &format!("/indexers/{}/reset", encode_segment(name)),
            None,
            format!("reset_indexer({})", name),
        )
        .await?;
        Ok(())
    }

    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus> {
        let label = format!("indexer_status({})", name);
        self.call(
            Method::Get,
            &format!("/indexers/{}/status", encode_segment(name)),
            None,
            label.clone(),
        )
        .await?
        .decode(&label)
    }

    async fn delete_indexer(&self, name: &str) -> Result<bool> {
        self.delete_resource("indexers", name, "delete_indexer").await
    }

    async fn create_or_update_data_source(&self, name: &str, definition: &Value) -> Result<()> {
        self.put_definition("datasources", name, definition, "create_or_update_data_source")
            .await
    }

    async fn get_data_source(&self, name: &str) -> Result<Option<Value>> {
        self.get_definition("datasources", name, "get_data_source").await
    }

    async fn delete_data_source(&self, name: &str) -> Result<bool> {
        self.delete_resource("datasources", name, "delete_data_source")
            .await
    }

    async fn create_or_update_skillset(&self, name: &str, definition: &Value) -> Result<()> {
        self.put_definition("skillsets", name, definition, "create_or_update_skillset")
            .await
    }

    async fn get_skillset(&self, name: &str) -> Result<Option<Value>> {
        self.get_definition("skillsets", name, "get_skillset").await
    }

    async fn delete_skillset(&self, name: &str) -> Result<bool> {
        self.delete_resource("skillsets", name, "delete_skillset").await
    }
}

/// Percent-encode a path segment (RFC 3986 unreserved characters pass through).
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
