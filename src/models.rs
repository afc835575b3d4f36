//! Core data models used throughout the index harness.
//!
//! These types represent the documents that flow from a corpus into the
//! remote index, and the per-document outcomes recorded on the way.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::IndexError;

/// Key field of every index this crate manages.
pub const ID_FIELD: &str = "id";
/// Searchable text field.
pub const CONTENT_FIELD: &str = "content";
/// Vector field holding [`Document::embedding`].
pub const VECTOR_FIELD: &str = "content_vector";
/// Field holding [`Document::content_hash`], used for incremental diffing.
pub const HASH_FIELD: &str = "content_hash";
/// Field holding [`Document::last_modified`].
pub const MODIFIED_FIELD: &str = "last_modified";

/// A unit of indexable content.
///
/// The `id` is derived deterministically from where the content lives
/// (see [`stable_id`]), so uploading the same logical document twice
/// overwrites it instead of creating a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Filled in by the pipeline when missing.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Additional typed fields: path, language, line ranges, tags, ...
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding: None,
            fields: BTreeMap::new(),
            last_modified: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// SHA-256 over the content and the canonical JSON of `fields`.
    ///
    /// The embedding and timestamp are excluded: touching a file without
    /// changing it must not make it look changed.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hasher.update([0u8]);
        // BTreeMap serializes with sorted keys.
        if let Ok(fields) = serde_json::to_vec(&self.fields) {
            hasher.update(&fields);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Disambiguating context for the embedding cache.
    ///
    /// Identical snippets in different languages or files may embed
    /// differently under context-aware models, so they are cached apart.
    pub fn embedding_context(&self) -> String {
        let language = self.field_str("language").unwrap_or_default();
        let path = self.field_str("path").unwrap_or_default();
        format!("{}|{}", language, path)
    }

    /// JSON body for a `mergeOrUpload` action.
    pub fn to_index_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        obj.insert(ID_FIELD.to_string(), json!(self.id));
        obj.insert(CONTENT_FIELD.to_string(), json!(self.content));
        if let Some(ref embedding) = self.embedding {
            obj.insert(VECTOR_FIELD.to_string(), json!(embedding));
        }
        obj.insert(HASH_FIELD.to_string(), json!(self.content_hash()));
        obj.insert(
            MODIFIED_FIELD.to_string(),
            json!(self
                .last_modified
                .to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Value::Object(obj)
    }
}

/// Derive a stable, URL-safe document key from its location parts.
///
/// ```rust
/// use index_harness::models::stable_id;
///
/// let a = stable_id(&["repo", "src/lib.rs", "1", "40"]);
/// let b = stable_id(&["repo", "src/lib.rs", "1", "40"]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn stable_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Outcome of one document in an upload call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentOutcome {
    pub id: String,
    /// `None` on success.
    pub error: Option<String>,
}

impl DocumentOutcome {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated outcomes of a pipeline run.
///
/// Holds exactly one [`DocumentOutcome`] per submitted document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub outcomes: Vec<DocumentOutcome>,
    /// Number of groups that were submitted.
    pub groups: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// [`IndexError::PartialBatch`] when any document failed.
    pub fn partial_failure(&self, operation: &str) -> Option<IndexError> {
        let failed = self.failed();
        (failed > 0).then(|| IndexError::PartialBatch {
            operation: operation.to_string(),
            failed,
            total: self.total(),
        })
    }

    pub fn extend(&mut self, other: BatchResult) {
        self.outcomes.extend(other.outcomes);
        self.groups += other.groups;
        self.elapsed += other.elapsed;
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} documents in {} groups: {} succeeded, {} failed",
            self.total(),
            self.groups,
            self.succeeded(),
            self.failed()
        )
    }
}

/// Restricts a reindex to documents whose `field` equals `value`.
///
/// Typically one repository or source: `repository=platform`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub field: String,
    pub value: String,
}

impl Scope {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// OData filter selecting the scope, with quotes escaped.
    pub fn filter_expression(&self) -> String {
        format!("{} eq '{}'", self.field, self.value.replace('\'', "''"))
    }

    /// Whether a document belongs to this scope.
    ///
    /// Collection fields match when any element equals the value.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.fields
            .get(&self.field)
            .is_some_and(|value| self.matches_value(value))
    }

    /// Same test as [`matches`](Self::matches) against a bare field value.
    pub fn matches_value(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => s == &self.value,
            Value::Array(items) => items.iter().any(|v| v.as_str() == Some(&self.value)),
            other => other.to_string() == self.value,
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, value) = s
            .split_once('=')
            .ok_or_else(|| format!("scope must be field=value, got '{}'", s))?;
        let field = field.trim();
        if field.is_empty() || value.is_empty() {
            return Err(format!("scope must be field=value, got '{}'", s));
        }
        Ok(Scope::new(field, value))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}
