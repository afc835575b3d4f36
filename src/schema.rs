//! Index schema definitions and diff-gated schema automation.
//!
//! [`SchemaAutomation::ensure_schema`] compares a desired
//! [`SchemaDefinition`] with the live one and only issues an update when
//! they differ structurally. Differences that cannot be applied in place
//! (type changes, removed fields, key or dimension changes) are reported
//! through [`SchemaDiff::requires_rebuild`] and never acted on here: the
//! reindex controller decides whether to drop and recreate the index.
//!
//! # Diff rules
//!
//! | Change | In-place? |
//! |--------|-----------|
//! | new field | yes |
//! | searchable / filterable / sortable / facetable / retrievable flipped | yes |
//! | vector profile renamed, vector or semantic settings changed | yes |
//! | field type changed | no |
//! | field removed | no |
//! | key field changed | no |
//! | vector dimensions changed | no |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{IndexError, Result};
use crate::index_ops::SearchService;
use crate::models::{CONTENT_FIELD, HASH_FIELD, ID_FIELD, MODIFIED_FIELD, VECTOR_FIELD};

/// Data type of an index field, in the service's `Edm.*` vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    DateTimeOffset,
    GeographyPoint,
    StringCollection,
    /// `Collection(Edm.Single)`, the vector type.
    SingleCollection,
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "Edm.String",
            FieldType::Int32 => "Edm.Int32",
            FieldType::Int64 => "Edm.Int64",
            FieldType::Double => "Edm.Double",
            FieldType::Boolean => "Edm.Boolean",
            FieldType::DateTimeOffset => "Edm.DateTimeOffset",
            FieldType::GeographyPoint => "Edm.GeographyPoint",
            FieldType::StringCollection => "Collection(Edm.String)",
            FieldType::SingleCollection => "Collection(Edm.Single)",
            FieldType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Edm.String" => FieldType::String,
            "Edm.Int32" => FieldType::Int32,
            "Edm.Int64" => FieldType::Int64,
            "Edm.Double" => FieldType::Double,
            "Edm.Boolean" => FieldType::Boolean,
            "Edm.DateTimeOffset" => FieldType::DateTimeOffset,
            "Edm.GeographyPoint" => FieldType::GeographyPoint,
            "Collection(Edm.String)" => FieldType::StringCollection,
            "Collection(Edm.Single)" => FieldType::SingleCollection,
            other => FieldType::Other(other.to_string()),
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, FieldType::SingleCollection)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FieldType::parse(&s))
    }
}

// The service reports `null` for flags that do not apply to a type.
fn null_as_false<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(d)?.unwrap_or(false))
}

fn null_as_true<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(d)?.unwrap_or(true))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, deserialize_with = "null_as_false")]
    pub key: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub searchable: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub filterable: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub sortable: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub facetable: bool,
    #[serde(default = "default_true", deserialize_with = "null_as_true")]
    pub retrievable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_search_profile: Option<String>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            key: false,
            searchable: false,
            filterable: false,
            sortable: false,
            facetable: false,
            retrievable: true,
            dimensions: None,
            vector_search_profile: None,
        }
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self.filterable = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    pub fn facetable(mut self) -> Self {
        self.facetable = true;
        self
    }

    pub fn vector(name: impl Into<String>, dims: u32, profile: impl Into<String>) -> Self {
        let mut field = Self::new(name, FieldType::SingleCollection);
        field.searchable = true;
        field.dimensions = Some(dims);
        field.vector_search_profile = Some(profile.into());
        field
    }

    fn flags(&self) -> [(&'static str, bool); 5] {
        [
            ("searchable", self.searchable),
            ("filterable", self.filterable),
            ("sortable", self.sortable),
            ("facetable", self.facetable),
            ("retrievable", self.retrievable),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorAlgorithm {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw_parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorProfile {
    pub name: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorSearch {
    #[serde(default)]
    pub algorithms: Vec<VectorAlgorithm>,
    #[serde(default)]
    pub profiles: Vec<VectorProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticConfiguration {
    pub name: String,
    pub prioritized_fields: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_configuration: Option<String>,
    #[serde(default)]
    pub configurations: Vec<SemanticConfiguration>,
}

/// An index definition: ordered fields plus vector and semantic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_search: Option<VectorSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticSettings>,
}

impl SchemaDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_field(&self) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key)
    }

    pub fn has_vector_search(&self) -> bool {
        self.fields.iter().any(|f| f.field_type.is_vector())
            && self
                .vector_search
                .as_ref()
                .map(|v| !v.profiles.is_empty())
                .unwrap_or(false)
    }

    pub fn has_semantic(&self) -> bool {
        self.semantic
            .as_ref()
            .map(|s| !s.configurations.is_empty())
            .unwrap_or(false)
    }

    /// Load a definition from a JSON file in the service's index format.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            IndexError::Config(format!("invalid schema file {}: {}", path.display(), e))
        })
    }

    /// Check the invariants the engine relies on: exactly one key field,
    /// unique names, and dimensions on every vector field.
    pub fn validate(&self) -> Result<()> {
        let keys = self.fields.iter().filter(|f| f.key).count();
        if keys != 1 {
            return Err(IndexError::Config(format!(
                "schema '{}' must have exactly one key field, found {}",
                self.name, keys
            )));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(IndexError::Config(format!(
                    "schema '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
            if field.field_type.is_vector() && field.dimensions.unwrap_or(0) == 0 {
                return Err(IndexError::Config(format!(
                    "vector field '{}' needs dimensions",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

/// The built-in schema for code and document search.
///
/// With `dims == 0` (embeddings disabled) the vector field and the vector
/// search settings are left out.
pub fn default_schema(index_name: &str, dims: u32) -> SchemaDefinition {
    let profile = "vector-profile";
    let mut schema = SchemaDefinition {
        name: index_name.to_string(),
        fields: vec![
            FieldDefinition::new(ID_FIELD, FieldType::String).key(),
            FieldDefinition::new(CONTENT_FIELD, FieldType::String).searchable(),
            FieldDefinition::vector(VECTOR_FIELD, dims, profile),
            FieldDefinition::new("path", FieldType::String)
                .searchable()
                .filterable()
                .facetable(),
            FieldDefinition::new("repository", FieldType::String)
                .filterable()
                .facetable(),
            FieldDefinition::new("language", FieldType::String)
                .filterable()
                .facetable(),
            FieldDefinition::new("start_line", FieldType::Int32).filterable(),
            FieldDefinition::new("end_line", FieldType::Int32).filterable(),
            FieldDefinition::new("tags", FieldType::StringCollection)
                .filterable()
                .facetable(),
            FieldDefinition::new(MODIFIED_FIELD, FieldType::DateTimeOffset)
                .filterable()
                .sortable(),
            FieldDefinition::new(HASH_FIELD, FieldType::String).filterable(),
        ],
        vector_search: Some(VectorSearch {
            algorithms: vec![VectorAlgorithm {
                name: "hnsw-default".to_string(),
                kind: "hnsw".to_string(),
                hnsw_parameters: None,
            }],
            profiles: vec![VectorProfile {
                name: profile.to_string(),
                algorithm: "hnsw-default".to_string(),
            }],
        }),
        semantic: Some(SemanticSettings {
            default_configuration: Some("default".to_string()),
            configurations: vec![SemanticConfiguration {
                name: "default".to_string(),
                prioritized_fields: serde_json::json!({
                    "titleField": { "fieldName": "path" },
                    "prioritizedContentFields": [{ "fieldName": CONTENT_FIELD }]
                }),
            }],
        }),
    };
    if dims == 0 {
        schema.fields.retain(|f| !f.field_type.is_vector());
        schema.vector_search = None;
    }
    schema
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeChange {
    pub field: String,
    pub live: FieldType,
    pub desired: FieldType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityChange {
    pub field: String,
    pub capability: &'static str,
    pub live: bool,
    pub desired: bool,
}

/// Structural difference between a desired and a live schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaDiff {
    /// The live index does not exist; creating it is not destructive.
    pub index_missing: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub type_changes: Vec<TypeChange>,
    pub capability_changes: Vec<CapabilityChange>,
    /// In-place changes to vector profiles or semantic settings.
    pub settings_changes: Vec<String>,
    /// Reasons the desired schema cannot be applied without a rebuild.
    pub incompatible: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        !self.index_missing
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.type_changes.is_empty()
            && self.capability_changes.is_empty()
            && self.settings_changes.is_empty()
            && self.incompatible.is_empty()
    }

    pub fn requires_rebuild(&self) -> bool {
        !self.incompatible.is_empty()
    }

    /// One-line description for logs and reports.
    pub fn summary(&self) -> String {
        if self.index_missing {
            return "index does not exist".to_string();
        }
        if self.is_empty() {
            return "no changes".to_string();
        }
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added: {}", self.added.join(", ")));
        }
        if !self.capability_changes.is_empty() {
            let names: Vec<String> = self
                .capability_changes
                .iter()
                .map(|c| format!("{}.{}", c.field, c.capability))
                .collect();
            parts.push(format!("capabilities: {}", names.join(", ")));
        }
        if !self.settings_changes.is_empty() {
            parts.push(format!("settings: {}", self.settings_changes.join(", ")));
        }
        if !self.incompatible.is_empty() {
            parts.push(format!("requires rebuild: {}", self.incompatible.join("; ")));
        }
        parts.join(" | ")
    }
}

/// Compute the structural diff from `live` to `desired`.
///
/// Field order is ignored; fields are matched by name.
pub fn diff_schemas(desired: &SchemaDefinition, live: Option<&SchemaDefinition>) -> SchemaDiff {
    let live = match live {
        Some(live) => live,
        None => {
            return SchemaDiff {
                index_missing: true,
                added: desired.fields.iter().map(|f| f.name.clone()).collect(),
                ..Default::default()
            }
        }
    };

    let mut diff = SchemaDiff::default();
    let live_fields: HashMap<&str, &FieldDefinition> =
        live.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let desired_names: BTreeSet<&str> = desired.fields.iter().map(|f| f.name.as_str()).collect();

    for want in &desired.fields {
        let have = match live_fields.get(want.name.as_str()) {
            Some(have) => *have,
            None => {
                diff.added.push(want.name.clone());
                if want.key {
                    diff.incompatible
                        .push(format!("key field '{}' is new", want.name));
                }
                continue;
            }
        };

        if have.field_type != want.field_type {
            diff.incompatible.push(format!(
                "field '{}' changes type {} -> {}",
                want.name, have.field_type, want.field_type
            ));
            diff.type_changes.push(TypeChange {
                field: want.name.clone(),
                live: have.field_type.clone(),
                desired: want.field_type.clone(),
            });
            continue;
        }

        if have.key != want.key {
            diff.incompatible
                .push(format!("field '{}' changes key status", want.name));
        }

        if have.dimensions != want.dimensions {
            diff.incompatible.push(format!(
                "field '{}' changes dimensions {:?} -> {:?}",
                want.name, have.dimensions, want.dimensions
            ));
        }

        if have.vector_search_profile != want.vector_search_profile {
            diff.settings_changes
                .push(format!("{}.vectorSearchProfile", want.name));
        }

        for ((capability, live_flag), (_, desired_flag)) in
            have.flags().into_iter().zip(want.flags())
        {
            if live_flag != desired_flag {
                diff.capability_changes.push(CapabilityChange {
                    field: want.name.clone(),
                    capability,
                    live: live_flag,
                    desired: desired_flag,
                });
            }
        }
    }

    for have in &live.fields {
        if !desired_names.contains(have.name.as_str()) {
            diff.removed.push(have.name.clone());
            diff.incompatible
                .push(format!("field '{}' would be removed", have.name));
        }
    }

    diff.settings_changes
        .extend(vector_settings_changes(desired, live));
    if semantic_names(desired) != semantic_names(live) {
        diff.settings_changes.push("semantic".to_string());
    }

    diff
}

// Compared by names only: the service fills in algorithm parameter
// defaults, so comparing full objects would never converge.
fn vector_settings_changes(desired: &SchemaDefinition, live: &SchemaDefinition) -> Vec<String> {
    let names = |s: &SchemaDefinition| -> (BTreeSet<(String, String)>, BTreeSet<(String, String)>) {
        let vs = s.vector_search.clone().unwrap_or_default();
        (
            vs.algorithms
                .into_iter()
                .map(|a| (a.name, a.kind))
                .collect(),
            vs.profiles
                .into_iter()
                .map(|p| (p.name, p.algorithm))
                .collect(),
        )
    };
    let (want_algos, want_profiles) = names(desired);
    let (have_algos, have_profiles) = names(live);
    let mut changes = Vec::new();
    if want_algos != have_algos {
        changes.push("vectorSearch.algorithms".to_string());
    }
    if want_profiles != have_profiles {
        changes.push("vectorSearch.profiles".to_string());
    }
    changes
}

fn semantic_names(s: &SchemaDefinition) -> BTreeSet<String> {
    s.semantic
        .as_ref()
        .map(|sem| sem.configurations.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// Outcome of [`SchemaAutomation::ensure_schema`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaReport {
    pub updated: bool,
    pub diff: SchemaDiff,
}

impl SchemaReport {
    pub fn requires_rebuild(&self) -> bool {
        self.diff.requires_rebuild()
    }

    /// Turn a rebuild-requiring report into a `SchemaIncompatible` error.
    pub fn into_result(self, index: &str) -> Result<Self> {
        if self.requires_rebuild() {
            return Err(IndexError::SchemaIncompatible {
                index: index.to_string(),
                summary: self.diff.incompatible.join("; "),
            });
        }
        Ok(self)
    }
}

/// Applies schema updates only when the live schema differs.
///
/// Never drops or recreates an index.
pub struct SchemaAutomation {
    service: Arc<dyn SearchService>,
}

impl SchemaAutomation {
    pub fn new(service: Arc<dyn SearchService>) -> Self {
        Self { service }
    }

    /// Read-only: diff `desired` against the live index.
    pub async fn plan(&self, desired: &SchemaDefinition) -> Result<SchemaDiff> {
        let live = self.service.get_index(&desired.name).await?;
        Ok(diff_schemas(desired, live.as_ref()))
    }

    pub async fn ensure_schema(&self, desired: &SchemaDefinition) -> Result<SchemaReport> {
        desired.validate()?;
        let diff = self.plan(desired).await?;

        if diff.is_empty() {
            info!(index = %desired.name, "schema up to date");
            return Ok(SchemaReport {
                updated: false,
                diff,
            });
        }

        if diff.requires_rebuild() {
            warn!(
                index = %desired.name,
                reasons = %diff.incompatible.join("; "),
                "schema change requires a rebuild; not applying"
            );
            return Ok(SchemaReport {
                updated: false,
                diff,
            });
        }

        info!(index = %desired.name, changes = %diff.summary(), "applying schema update");
        self.service.create_or_update_index(desired).await?;
        Ok(SchemaReport {
            updated: true,
            diff,
        })
    }
}
