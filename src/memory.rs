//! In-memory [`SearchService`] implementation for tests and offline runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Filters support the single
//! `field eq 'value'` form the reindex controller produces. Failures can
//! be scripted per operation or per document key, and every call is
//! recorded so tests can assert which mutations were issued.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{IndexError, Result};
use crate::index_ops::{IndexStatistics, IndexerExecution, IndexerStatus, IndexingResult, SearchService};
use crate::models::{Document, ID_FIELD, VECTOR_FIELD};
use crate::schema::SchemaDefinition;

struct StoredIndex {
    schema: SchemaDefinition,
    docs: BTreeMap<String, Value>,
}

struct StoredIndexer {
    definition: Value,
    runs: u64,
    last_result: Option<IndexerExecution>,
}

/// In-memory search service.
#[derive(Default)]
pub struct InMemoryIndex {
    indexes: RwLock<HashMap<String, StoredIndex>>,
    indexers: RwLock<HashMap<String, StoredIndexer>>,
    data_sources: RwLock<HashMap<String, Value>>,
    skillsets: RwLock<HashMap<String, Value>>,
    calls: Mutex<Vec<String>>,
    /// key → remaining whole-call failures for uploads containing it.
    upload_faults: Mutex<HashMap<String, u32>>,
    rejected_keys: RwLock<HashSet<String>>,
    undeletable_keys: RwLock<HashSet<String>>,
    failing_ops: RwLock<HashSet<String>>,
}

const MUTATING_OPS: &[&str] = &[
    "create_or_update_index",
    "delete_index",
    "upload_documents",
    "delete_documents",
    "create_or_update_indexer",
    "run_indexer",
    "reset_indexer",
    "delete_indexer",
    "create_or_update_data_source",
    "delete_data_source",
    "create_or_update_skillset",
    "delete_skillset",
];

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index holding `docs`, bypassing the call log.
    pub fn seed(&self, schema: SchemaDefinition, docs: &[Document]) {
        let stored = StoredIndex {
            docs: docs
                .iter()
                .map(|d| (d.id.clone(), d.to_index_json()))
                .collect(),
            schema,
        };
        self.indexes
            .write()
            .unwrap()
            .insert(stored.schema.name.clone(), stored);
    }

    /// Fail the next `times` upload calls whose batch contains `key`.
    pub fn fail_uploads_containing(&self, key: &str, times: u32) {
        self.upload_faults
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
    }

    /// Reject `key` with a per-document error on every upload.
    pub fn reject_key(&self, key: &str) {
        self.rejected_keys.write().unwrap().insert(key.to_string());
    }

    /// Refuse to delete `key`, answering with a per-key failure.
    pub fn reject_delete(&self, key: &str) {
        self.undeletable_keys.write().unwrap().insert(key.to_string());
    }

    /// Make every call to `operation` fail with a transient error.
    pub fn fail_operation(&self, operation: &str) {
        self.failing_ops
            .write()
            .unwrap()
            .insert(operation.to_string());
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    /// Calls that would have changed remote state.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATING_OPS.contains(&c.as_str()))
            .collect()
    }

    pub fn document(&self, index: &str, key: &str) -> Option<Value> {
        self.indexes
            .read()
            .unwrap()
            .get(index)
            .and_then(|i| i.docs.get(key).cloned())
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.indexes
            .read()
            .unwrap()
            .get(index)
            .map(|i| i.docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn indexer_runs(&self, name: &str) -> u64 {
        self.indexers
            .read()
            .unwrap()
            .get(name)
            .map(|i| i.runs)
            .unwrap_or(0)
    }

    fn record(&self, operation: &str) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing_ops.read().unwrap().contains(operation) {
            return Err(IndexError::Transient {
                operation: operation.to_string(),
                status: Some(503),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn take_upload_fault(&self, docs: &[Document]) -> bool {
        let mut faults = self.upload_faults.lock().unwrap();
        for doc in docs {
            if let Some(remaining) = faults.get_mut(&doc.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn not_found(operation: &str, name: &str) -> IndexError {
        IndexError::NotFound {
            operation: format!("{}({})", operation, name),
            message: format!("'{}' was not found", name),
        }
    }
}

/// Parse `field eq 'value'` into its parts.
fn parse_eq_filter(filter: &str) -> Option<(String, String)> {
    let (field, rest) = filter.split_once(" eq ")?;
    let rest = rest.trim();
    let value = rest.strip_prefix('\'')?.strip_suffix('\'')?;
    Some((field.trim().to_string(), value.replace("''", "'")))
}

fn field_matches(doc: &Value, field: &str, value: &str) -> bool {
    match doc.get(field) {
        Some(Value::String(s)) => s == value,
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(value)),
        _ => false,
    }
}

#[async_trait]
impl SearchService for InMemoryIndex {
    async fn get_index(&self, name: &str) -> Result<Option<SchemaDefinition>> {
        self.record("get_index")?;
        Ok(self
            .indexes
            .read()
            .unwrap()
            .get(name)
            .map(|i| i.schema.clone()))
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        self.record("list_indexes")?;
        let mut names: Vec<String> = self.indexes.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_or_update_index(&self, schema: &SchemaDefinition) -> Result<()> {
        self.record("create_or_update_index")?;
        let mut indexes = self.indexes.write().unwrap();
        match indexes.get_mut(&schema.name) {
            Some(existing) => existing.schema = schema.clone(),
            None => {
                indexes.insert(
                    schema.name.clone(),
                    StoredIndex {
                        schema: schema.clone(),
                        docs: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<bool> {
        self.record("delete_index")?;
        Ok(self.indexes.write().unwrap().remove(name).is_some())
    }

    async fn index_statistics(&self, name: &str) -> Result<IndexStatistics> {
        self.record("index_statistics")?;
        let indexes = self.indexes.read().unwrap();
        let index = indexes
            .get(name)
            .ok_or_else(|| Self::not_found("index_statistics", name))?;
        let mut storage_size = 0u64;
        let mut vector_index_size = 0u64;
        for doc in index.docs.values() {
            storage_size += doc.to_string().len() as u64;
            if let Some(Value::Array(v)) = doc.get(VECTOR_FIELD) {
                vector_index_size += (v.len() * 4) as u64;
            }
        }
        Ok(IndexStatistics {
            document_count: index.docs.len() as u64,
            storage_size,
            vector_index_size,
        })
    }

    async fn upload_documents(&self, index: &str, docs: &[Document]) -> Result<Vec<IndexingResult>> {
        self.record("upload_documents")?;
        if self.take_upload_fault(docs) {
            return Err(IndexError::Transient {
                operation: format!("upload_documents({})", index),
                status: Some(503),
                message: "injected upload failure".to_string(),
            });
        }
        let rejected = self.rejected_keys.read().unwrap();
        let mut indexes = self.indexes.write().unwrap();
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Self::not_found("upload_documents", index))?;
        Ok(docs
            .iter()
            .map(|doc| {
                if rejected.contains(&doc.id) {
                    IndexingResult::failed(&doc.id, 400, "document rejected")
                } else {
                    stored.docs.insert(doc.id.clone(), doc.to_index_json());
                    IndexingResult::ok(&doc.id)
                }
            })
            .collect())
    }

    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<Vec<IndexingResult>> {
        self.record("delete_documents")?;
        let mut indexes = self.indexes.write().unwrap();
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Self::not_found("delete_documents", index))?;
        let undeletable = self.undeletable_keys.read().unwrap();
        // Deleting a missing key succeeds, as it does remotely.
        Ok(keys
            .iter()
            .map(|key| {
                if undeletable.contains(key) {
                    return IndexingResult::failed(key, 409, "document is locked");
                }
                stored.docs.remove(key);
                IndexingResult::ok(key)
            })
            .collect())
    }

    async fn get_document(&self, index: &str, key: &str) -> Result<Option<Value>> {
        self.record("get_document")?;
        Ok(self.document(index, key))
    }

    async fn count_documents(&self, index: &str) -> Result<u64> {
        self.record("count_documents")?;
        self.indexes
            .read()
            .unwrap()
            .get(index)
            .map(|i| i.docs.len() as u64)
            .ok_or_else(|| Self::not_found("count_documents", index))
    }

    async fn search_keys(&self, index: &str, filter: &str, top: usize, skip: usize) -> Result<Vec<String>> {
        self.record("search_keys")?;
        let (field, value) = parse_eq_filter(filter).ok_or_else(|| IndexError::Permanent {
            operation: format!("search_keys({})", index),
            status: 400,
            message: format!("unsupported filter: {}", filter),
        })?;
        let indexes = self.indexes.read().unwrap();
        let stored = indexes
            .get(index)
            .ok_or_else(|| Self::not_found("search_keys", index))?;
        Ok(stored
            .docs
            .values()
            .filter(|doc| field_matches(doc, &field, &value))
            .filter_map(|doc| doc.get(ID_FIELD).and_then(|k| k.as_str()).map(String::from))
            .skip(skip)
            .take(top)
            .collect())
    }

    async fn create_or_update_indexer(&self, name: &str, definition: &Value) -> Result<()> {
        self.record("create_or_update_indexer")?;
        let mut indexers = self.indexers.write().unwrap();
        match indexers.get_mut(name) {
            Some(existing) => existing.definition = definition.clone(),
            None => {
                indexers.insert(
                    name.to_string(),
                    StoredIndexer {
                        definition: definition.clone(),
                        runs: 0,
                        last_result: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn run_indexer(&self, name: &str) -> Result<()> {
        self.record("run_indexer")?;
        let mut indexers = self.indexers.write().unwrap();
        let indexer = indexers
            .get_mut(name)
            .ok_or_else(|| Self::not_found("run_indexer", name))?;
        indexer.runs += 1;
        indexer.last_result = Some(IndexerExecution {
            status: "success".to_string(),
            error_message: None,
            item_count: 0,
            failed_item_count: 0,
        });
        Ok(())
    }

    async fn reset_indexer(&self, name: &str) -> Result<()> {
        self.record("reset_indexer")?;
        let mut indexers = self.indexers.write().unwrap();
        let indexer = indexers
            .get_mut(name)
            .ok_or_else(|| Self::not_found("reset_indexer", name))?;
        indexer.last_result = None;
        Ok(())
    }

    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus> {
        self.record("indexer_status")?;
        let indexers = self.indexers.read().unwrap();
        let indexer = indexers
            .get(name)
            .ok_or_else(|| Self::not_found("indexer_status", name))?;
        Ok(IndexerStatus {
            name: name.to_string(),
            status: if indexer.definition.get("disabled") == Some(&Value::Bool(true)) {
                "disabled".to_string()
            } else {
                "running".to_string()
            },
            last_result: indexer.last_result.clone(),
        })
    }

    async fn delete_indexer(&self, name: &str) -> Result<bool> {
        self.record("delete_indexer")?;
        Ok(self.indexers.write().unwrap().remove(name).is_some())
    }

    async fn create_or_update_data_source(&self, name: &str, definition: &Value) -> Result<()> {
        self.record("create_or_update_data_source")?;
        self.data_sources
            .write()
            .unwrap()
            .insert(name.to_string(), definition.clone());
        Ok(())
    }

    async fn get_data_source(&self, name: &str) -> Result<Option<Value>> {
        self.record("get_data_source")?;
        Ok(self.data_sources.read().unwrap().get(name).cloned())
    }

    async fn delete_data_source(&self, name: &str) -> Result<bool> {
        self.record("delete_data_source")?;
        Ok(self.data_sources.write().unwrap().remove(name).is_some())
    }

    async fn create_or_update_skillset(&self, name: &str, definition: &Value) -> Result<()> {
        self.record("create_or_update_skillset")?;
        self.skillsets
            .write()
            .unwrap()
            .insert(name.to_string(), definition.clone());
        Ok(())
    }

    async fn get_skillset(&self, name: &str) -> Result<Option<Value>> {
        self.record("get_skillset")?;
        Ok(self.skillsets.read().unwrap().get(name).cloned())
    }

    async fn delete_skillset(&self, name: &str) -> Result<bool> {
        self.record("delete_skillset")?;
        Ok(self.skillsets.write().unwrap().remove(name).is_some())
    }
}
