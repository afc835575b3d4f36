//! Point-in-time index health.
//!
//! [`HealthMonitor::snapshot`] reads the live schema and statistics and
//! derives feature flags and warnings from them. It never fails: a read
//! that errors leaves the corresponding fields `None` (unknown) and adds a
//! warning, so the reindex decision can stay conservative.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::index_ops::SearchService;
use crate::schema::{diff_schemas, SchemaDefinition};

/// Utilisation above which a warning is raised.
pub const QUOTA_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub index: String,
    pub taken_at: DateTime<Utc>,
    pub exists: Option<bool>,
    pub document_count: Option<u64>,
    pub storage_size: Option<u64>,
    pub vector_index_size: Option<u64>,
    /// Whether the live schema can reach the expected one without a rebuild.
    /// `None` when no expected schema was given or the live one is unknown.
    pub schema_compliant: Option<bool>,
    pub vector_search: Option<bool>,
    pub semantic_search: Option<bool>,
    pub storage_quota: Option<u64>,
    pub utilization: Option<f64>,
    pub warnings: Vec<String>,
}

impl HealthSnapshot {
    fn unknown(index: &str) -> Self {
        Self {
            index: index.to_string(),
            taken_at: Utc::now(),
            exists: None,
            document_count: None,
            storage_size: None,
            vector_index_size: None,
            schema_compliant: None,
            vector_search: None,
            semantic_search: None,
            storage_quota: None,
            utilization: None,
            warnings: Vec::new(),
        }
    }

    /// Known to hold zero documents. Unknown counts are not empty.
    pub fn is_empty(&self) -> bool {
        self.document_count == Some(0)
    }

    /// Known to be non-compliant. Unknown compliance is not a violation.
    pub fn is_non_compliant(&self) -> bool {
        self.schema_compliant == Some(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.exists == Some(true) && !self.is_empty() && !self.is_non_compliant() && self.warnings.is_empty()
    }
}

fn known<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "unknown".to_string(),
    }
}

impl fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "index:            {}", self.index)?;
        writeln!(f, "exists:           {}", known(&self.exists))?;
        writeln!(f, "documents:        {}", known(&self.document_count))?;
        writeln!(f, "storage bytes:    {}", known(&self.storage_size))?;
        writeln!(f, "vector bytes:     {}", known(&self.vector_index_size))?;
        writeln!(f, "schema compliant: {}", known(&self.schema_compliant))?;
        writeln!(f, "vector search:    {}", known(&self.vector_search))?;
        writeln!(f, "semantic search:  {}", known(&self.semantic_search))?;
        if let Some(u) = self.utilization {
            writeln!(f, "utilization:      {:.1}%", u * 100.0)?;
        }
        for w in &self.warnings {
            writeln!(f, "warning:          {}", w)?;
        }
        Ok(())
    }
}

pub struct HealthMonitor {
    service: Arc<dyn SearchService>,
    storage_quota: Option<u64>,
}

impl HealthMonitor {
    pub fn new(service: Arc<dyn SearchService>, storage_quota: Option<u64>) -> Self {
        Self {
            service,
            storage_quota,
        }
    }

    /// Read the current state of `index`; compliance is judged against
    /// `expected` when given.
    pub async fn snapshot(&self, index: &str, expected: Option<&SchemaDefinition>) -> HealthSnapshot {
        let mut snap = HealthSnapshot::unknown(index);
        snap.storage_quota = self.storage_quota;

        let (live, stats) = futures::join!(
            self.service.get_index(index),
            self.service.index_statistics(index)
        );

        match live {
            Ok(Some(live)) => {
                snap.exists = Some(true);
                snap.vector_search = Some(live.has_vector_search());
                snap.semantic_search = Some(live.has_semantic());
                if live.key_field().is_none() {
                    snap.warnings.push("live schema has no key field".to_string());
                }
                if !live.has_vector_search() {
                    snap.warnings.push("no vector field; vector search unavailable".to_string());
                }
                if let Some(expected) = expected {
                    let diff = diff_schemas(expected, Some(&live));
                    snap.schema_compliant = Some(!diff.requires_rebuild());
                    if diff.requires_rebuild() {
                        snap.warnings
                            .push(format!("schema requires rebuild: {}", diff.incompatible.join("; ")));
                    }
                }
            }
            Ok(None) => {
                snap.exists = Some(false);
                snap.document_count = Some(0);
                snap.storage_size = Some(0);
                snap.vector_index_size = Some(0);
                snap.vector_search = Some(false);
                snap.semantic_search = Some(false);
                if expected.is_some() {
                    snap.schema_compliant = Some(false);
                }
                snap.warnings.push("index does not exist".to_string());
            }
            Err(e) => {
                warn!(index, error = %e, "could not read schema");
                snap.warnings.push(format!("schema unknown: {}", e));
            }
        }

        if snap.exists != Some(false) {
            match stats {
                Ok(stats) => {
                    snap.document_count = Some(stats.document_count);
                    snap.storage_size = Some(stats.storage_size);
                    snap.vector_index_size = Some(stats.vector_index_size);
                }
                Err(e) => {
                    warn!(index, error = %e, "could not read statistics");
                    snap.warnings.push(format!("statistics unknown: {}", e));
                }
            }
        }

        if let (Some(size), Some(quota)) = (snap.storage_size, self.storage_quota) {
            if quota > 0 {
                let ratio = size as f64 / quota as f64;
                snap.utilization = Some(ratio);
                if ratio > QUOTA_WARNING_RATIO {
                    snap.warnings.push(format!(
                        "storage at {:.0}% of quota ({} of {} bytes)",
                        ratio * 100.0,
                        size,
                        quota
                    ));
                }
            }
        }

        debug!(
            index,
            documents = ?snap.document_count,
            compliant = ?snap.schema_compliant,
            warnings = snap.warnings.len(),
            "health snapshot"
        );
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIndex;
    use crate::models::Document;
    use crate::schema::{default_schema, FieldType};

    fn seeded(docs: usize) -> Arc<InMemoryIndex> {
        let service = Arc::new(InMemoryIndex::new());
        let docs: Vec<Document> = (0..docs)
            .map(|i| Document::new(format!("d{}", i), "x".repeat(100)))
            .collect();
        service.seed(default_schema("code", 4), &docs);
        service
    }

    #[tokio::test]
    async fn healthy_index() {
        let service = seeded(3);
        let monitor = HealthMonitor::new(service, None);
        let expected = default_schema("code", 4);
        let snap = monitor.snapshot("code", Some(&expected)).await;

        assert_eq!(snap.exists, Some(true));
        assert_eq!(snap.document_count, Some(3));
        assert_eq!(snap.schema_compliant, Some(true));
        assert_eq!(snap.vector_search, Some(true));
        assert_eq!(snap.semantic_search, Some(true));
        assert!(snap.is_healthy(), "{:?}", snap.warnings);
    }

    #[tokio::test]
    async fn missing_index_is_known_empty() {
        let monitor = HealthMonitor::new(Arc::new(InMemoryIndex::new()), None);
        let snap = monitor.snapshot("code", None).await;
        assert_eq!(snap.exists, Some(false));
        assert!(snap.is_empty());
        assert_eq!(snap.schema_compliant, None);
    }

    #[tokio::test]
    async fn failed_reads_become_unknown() {
        let service = seeded(3);
        service.fail_operation("index_statistics");
        let monitor = HealthMonitor::new(service.clone(), Some(1000));
        let snap = monitor.snapshot("code", None).await;

        assert_eq!(snap.exists, Some(true));
        assert_eq!(snap.document_count, None);
        assert_eq!(snap.utilization, None);
        assert!(!snap.is_empty());
        assert!(snap.warnings.iter().any(|w| w.starts_with("statistics unknown")));

        service.fail_operation("get_index");
        let snap = monitor.snapshot("code", Some(&default_schema("code", 4))).await;
        assert_eq!(snap.exists, None);
        assert_eq!(snap.schema_compliant, None);
        assert!(!snap.is_non_compliant());
    }

    #[tokio::test]
    async fn type_change_is_non_compliant() {
        let service = seeded(1);
        let mut expected = default_schema("code", 4);
        for f in expected.fields.iter_mut().filter(|f| f.name == "start_line") {
            f.field_type = FieldType::String;
        }
        let snap = HealthMonitor::new(service, None)
            .snapshot("code", Some(&expected))
            .await;
        assert!(snap.is_non_compliant());
    }

    #[tokio::test]
    async fn quota_warning_above_threshold() {
        let service = seeded(10);
        let monitor = HealthMonitor::new(service, Some(1));
        let snap = monitor.snapshot("code", None).await;
        assert!(snap.utilization.unwrap() > 1.0);
        assert!(snap.warnings.iter().any(|w| w.contains("of quota")));
    }
}
