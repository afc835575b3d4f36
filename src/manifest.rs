//! Last-known index state for incremental reindexing.
//!
//! The manifest maps each document id to the content hash of its last
//! successful upload, plus the document's scalar and array fields so a
//! run scoped to `field=value` can find ids that disappeared from that
//! slice of the corpus. It is persisted as JSON when a path is configured and kept in
//! memory otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};
use crate::models::{Document, Scope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: String,
    /// Top-level fields a scope can select on (path, repository, tags, ...).
    /// Matched with [`Scope::matches_value`], the same test applied to
    /// documents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, Value>,
}

impl ManifestEntry {
    pub fn from_document(doc: &Document) -> Self {
        let labels = doc
            .fields
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Null | Value::Object(_)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            hash: doc.content_hash(),
            labels,
        }
    }

    /// Placeholder for a key found in the index under `scope` without a
    /// manifest entry. The empty hash never matches a document.
    pub fn untracked(scope: &Scope) -> Self {
        Self {
            hash: String::new(),
            labels: BTreeMap::from([(scope.field.clone(), Value::String(scope.value.clone()))]),
        }
    }

    fn in_scope(&self, scope: &Scope) -> bool {
        self.labels
            .get(&scope.field)
            .is_some_and(|v| scope.matches_value(v))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file yields an empty manifest bound to it.
    pub fn load(path: &Path) -> Result<Self> {
        let mut manifest = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes).map_err(|e| IndexError::Decode {
                operation: format!("load_manifest({})", path.display()),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::default(),
            Err(e) => return Err(e.into()),
        };
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Write to the bound path via a temp file and rename. No-op in memory.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = Some(Utc::now());
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| IndexError::Decode {
            operation: "save_manifest".to_string(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.get(id)
    }

    /// True when `doc` was uploaded before with the same content hash.
    pub fn is_unchanged(&self, doc: &Document) -> bool {
        self.entries
            .get(&doc.id)
            .is_some_and(|e| e.hash == doc.content_hash())
    }

    /// Known ids, restricted to `scope` when given.
    pub fn ids(&self, scope: Option<&Scope>) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(_, e)| scope.map_or(true, |s| e.in_scope(s)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn record(&mut self, id: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry in `scope`; returns how many were dropped.
    pub fn clear_scope(&mut self, scope: &Scope) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.in_scope(scope));
        before - self.entries.len()
    }
}
