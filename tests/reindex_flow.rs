//! End-to-end reindex flows against the in-memory search service.
//!
//! Each test builds a corpus, runs the controller one or more times, and
//! checks both the report and the calls that reached the service.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use index_harness::config::{PipelineConfig, ReindexConfig};
use index_harness::corpus::{Corpus, VecCorpus};
use index_harness::embed_cache::EmbeddingCache;
use index_harness::embedding::MockProvider;
use index_harness::error::Result;
use index_harness::index_ops::{IndexStatistics, IndexerStatus, IndexingResult, SearchService};
use index_harness::manifest::Manifest;
use index_harness::memory::InMemoryIndex;
use index_harness::models::{Document, Scope, VECTOR_FIELD};
use index_harness::reindex::{ReindexController, ReindexRequest, RunState, Strategy};
use index_harness::schema::{default_schema, FieldDefinition, FieldType, SchemaAutomation, SchemaDefinition};

const INDEX: &str = "code";

fn doc(id: &str, repo: &str, content: &str) -> Document {
    Document::new(id, content)
        .with_field("repository", repo)
        .with_field("path", format!("{}/{}.rs", repo, id))
        .with_field("language", "rust")
}

fn corpus() -> Vec<Document> {
    vec![
        doc("a1", "alpha", "fn a1() {}"),
        doc("a2", "alpha", "fn a2() {}"),
        doc("b1", "beta", "fn b1() {}"),
        doc("b2", "beta", "fn b2() {}"),
        doc("b3", "beta", "fn b3() {}"),
    ]
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 2,
        workers: 2,
        group_attempts: 2,
        group_backoff_ms: 1,
    }
}

fn controller(service: &Arc<InMemoryIndex>, docs: Vec<Document>, manifest: Manifest) -> ReindexController {
    controller_with_schema(service, docs, manifest, default_schema(INDEX, 0))
}

fn controller_with_schema(
    service: &Arc<InMemoryIndex>,
    docs: Vec<Document>,
    manifest: Manifest,
    schema: SchemaDefinition,
) -> ReindexController {
    ReindexController::new(service.clone(), Arc::new(VecCorpus::new("test", docs)), schema)
        .with_pipeline_config(pipeline_config())
        .with_manifest(manifest)
}

fn ids(service: &InMemoryIndex) -> BTreeSet<String> {
    service.document_ids(INDEX).into_iter().collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn initial_load(service: &Arc<InMemoryIndex>) -> Manifest {
    let c = controller(service, corpus(), Manifest::in_memory());
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_completed(), "{:?}", report.state);
    c.manifest()
}

#[tokio::test]
async fn missing_index_is_built_from_scratch() {
    let service = Arc::new(InMemoryIndex::new());
    let c = controller(&service, corpus(), Manifest::in_memory());

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.plan.strategy, Strategy::FullRebuild { .. }));
    assert_eq!(report.plan.steps, vec!["ensure_schema", "upload"]);
    assert_eq!(report.state, RunState::Completed);
    assert!(report.schema_updated);
    assert_eq!(report.batch.succeeded(), 5);
    assert_eq!(report.batch.groups, 3);
    assert_eq!(ids(&service), set(&["a1", "a2", "b1", "b2", "b3"]));
    assert_eq!(service.call_count("delete_index"), 0);
    assert_eq!(c.manifest().len(), 5);
}

#[tokio::test]
async fn second_run_uploads_nothing() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;
    let uploads_before = service.call_count("upload_documents");

    let c = controller(&service, corpus(), manifest);
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.plan.strategy, Strategy::Incremental);
    assert!(report.is_completed());
    assert_eq!(report.batch.total(), 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(service.call_count("upload_documents"), uploads_before);
    assert_eq!(ids(&service).len(), 5);
}

#[tokio::test]
async fn incremental_uploads_changes_and_deletes_vanished() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    let mut docs = corpus();
    docs.retain(|d| d.id != "b3");
    docs[0].content = "fn a1() { changed() }".to_string();
    docs.push(doc("c1", "gamma", "fn c1() {}"));

    let c = controller(&service, docs, manifest);
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.plan.strategy, Strategy::Incremental);
    assert_eq!(report.plan.steps, vec!["upload", "delete_vanished"]);
    assert!(report.is_completed());
    let uploaded: BTreeSet<String> = report.batch.outcomes.iter().map(|o| o.id.clone()).collect();
    assert_eq!(uploaded, set(&["a1", "c1"]));
    assert_eq!(report.deleted, 1);
    assert_eq!(ids(&service), set(&["a1", "a2", "b1", "b2", "c1"]));
    assert_eq!(
        service.document(INDEX, "a1").unwrap()["content"],
        json!("fn a1() { changed() }")
    );

    let manifest = c.manifest();
    assert!(manifest.get("b3").is_none());
    assert!(manifest.get("c1").is_some());
}

#[tokio::test]
async fn explicit_changed_ids_skip_detection() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    let c = controller(&service, corpus(), manifest);
    let request = ReindexRequest {
        changed_ids: Some(set(&["b2"])),
        ..Default::default()
    };
    let report = c.run(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.batch.total(), 1);
    assert_eq!(report.batch.outcomes[0].id, "b2");
    assert_eq!(report.deleted, 0);
}

#[tokio::test]
async fn scoped_run_clears_and_reloads_only_that_scope() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    // a2 disappeared from the alpha repository; beta is untouched.
    let docs: Vec<Document> = corpus().into_iter().filter(|d| d.id != "a2").collect();
    let c = controller(&service, docs, manifest);
    let request = ReindexRequest {
        scope: Some(Scope::new("repository", "alpha")),
        ..Default::default()
    };
    let report = c.run(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(
        report.plan.strategy,
        Strategy::FilteredClear {
            scope: Scope::new("repository", "alpha")
        }
    );
    assert!(report.is_completed());
    assert_eq!(report.deleted, 2);
    assert_eq!(report.batch.total(), 1);
    assert_eq!(ids(&service), set(&["a1", "b1", "b2", "b3"]));
    assert!(c.manifest().get("a2").is_none());
    assert!(c.manifest().get("b1").is_some());
}

#[tokio::test]
async fn dry_run_issues_no_mutations() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;
    let mutations_before = service.mutations().len();

    let mut docs = corpus();
    docs.pop();
    docs[1].content = "fn a2() { edited() }".to_string();

    let c = controller(&service, docs, manifest);
    let request = ReindexRequest {
        dry_run: true,
        ..Default::default()
    };
    let report = c.run(&request, &CancellationToken::new()).await.unwrap();

    assert!(report.plan.dry_run);
    assert_eq!(report.plan.strategy, Strategy::Incremental);
    let changes = report.plan.changes.clone().unwrap();
    assert_eq!(changes.upload, 1);
    assert_eq!(changes.unchanged, 3);
    assert_eq!(changes.delete, 1);
    assert_eq!(service.mutations().len(), mutations_before);
    assert!(report.to_string().contains("1 to upload"));
}

#[tokio::test]
async fn dry_run_full_rebuild_on_missing_index() {
    let service = Arc::new(InMemoryIndex::new());
    let c = controller(&service, corpus(), Manifest::in_memory());
    let request = ReindexRequest {
        dry_run: true,
        ..Default::default()
    };
    let report = c.run(&request, &CancellationToken::new()).await.unwrap();

    assert!(matches!(report.plan.strategy, Strategy::FullRebuild { .. }));
    assert_eq!(report.plan.changes.as_ref().map(|c| c.upload), Some(5));
    assert!(service.mutations().is_empty());
    assert!(service.get_index(INDEX).await.unwrap().is_none());
}

#[tokio::test]
async fn configured_indexer_takes_over() {
    let service = Arc::new(InMemoryIndex::new());
    initial_load(&service).await;
    service
        .create_or_update_indexer("nightly", &json!({ "dataSourceName": "blobs" }))
        .await
        .unwrap();

    let c = controller(&service, corpus(), Manifest::in_memory()).with_config(ReindexConfig {
        indexer: Some("nightly".to_string()),
        ..Default::default()
    });

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.plan.strategy,
        Strategy::IndexerDelegated {
            indexer: "nightly".to_string(),
            reset: false
        }
    );
    assert!(report.is_completed());
    assert_eq!(service.indexer_runs("nightly"), 1);
    assert_eq!(service.call_count("reset_indexer"), 0);
    assert_eq!(report.indexer_status.as_ref().map(|s| s.status.as_str()), Some("running"));
    assert_eq!(report.batch.total(), 0);

    let forced = ReindexRequest {
        force_full: true,
        ..Default::default()
    };
    let report = c.run(&forced, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        report.plan.steps,
        vec!["reset_indexer", "run_indexer", "indexer_status"]
    );
    assert_eq!(service.call_count("reset_indexer"), 1);
    assert_eq!(service.indexer_runs("nightly"), 2);
}

#[tokio::test]
async fn missing_indexer_fails_the_run() {
    let service = Arc::new(InMemoryIndex::new());
    initial_load(&service).await;

    let c = controller(&service, corpus(), Manifest::in_memory()).with_config(ReindexConfig {
        indexer: Some("ghost".to_string()),
        ..Default::default()
    });
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    match report.state {
        RunState::Failed { ref step, ref error } => {
            assert_eq!(step, "run_indexer");
            assert!(error.contains("ghost"), "{}", error);
        }
        ref other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn failing_step_halts_without_later_steps() {
    let service = Arc::new(InMemoryIndex::new());
    service.fail_operation("create_or_update_index");
    let c = controller(&service, corpus(), Manifest::in_memory());

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.state, RunState::Failed { ref step, .. } if step == "ensure_schema"));
    assert_eq!(report.batch.total(), 0);
    assert_eq!(service.call_count("upload_documents"), 0);
    assert!(c.manifest().is_empty());
}

#[tokio::test]
async fn delete_failure_keeps_partial_upload() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;
    service.fail_operation("delete_documents");

    let mut docs = corpus();
    docs.pop();
    docs[0].content = "fn a1() { v2() }".to_string();

    let c = controller(&service, docs, manifest);
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.state, RunState::Failed { ref step, .. } if step == "delete_vanished"));
    assert_eq!(report.batch.succeeded(), 1);
    // The upload that did land is remembered; the undeleted doc stays known.
    let manifest = c.manifest();
    assert!(manifest.get("b3").is_some());
    let expected = doc("a1", "alpha", "fn a1() { v2() }").content_hash();
    assert_eq!(manifest.get("a1").map(|e| e.hash.as_str()), Some(expected.as_str()));
}

#[tokio::test]
async fn rejected_documents_are_retried_next_run() {
    let service = Arc::new(InMemoryIndex::new());
    service.reject_key("b2");
    let c = controller(&service, corpus(), Manifest::in_memory());

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.batch.failed(), 1);
    assert!(report.batch.partial_failure("reindex").is_some());
    assert!(c.manifest().get("b2").is_none());

    let preview = c
        .run(
            &ReindexRequest {
                dry_run: true,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(preview.plan.changes.map(|c| c.upload), Some(1));
}

#[tokio::test]
async fn transient_group_failures_are_absorbed() {
    let service = Arc::new(InMemoryIndex::new());
    service.fail_uploads_containing("b1", 1);
    let c = controller(&service, corpus(), Manifest::in_memory());

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.batch.succeeded(), 5);
    assert_eq!(service.call_count("upload_documents"), 4);
}

#[tokio::test]
async fn compatible_schema_change_is_applied_in_place() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    let mut desired = default_schema(INDEX, 0);
    desired
        .fields
        .push(FieldDefinition::new("owner", FieldType::String).filterable());
    let c = controller_with_schema(&service, corpus(), manifest, desired);

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.plan.strategy, Strategy::Incremental);
    assert_eq!(report.plan.schema_diff.added, vec!["owner".to_string()]);
    assert!(report.schema_updated);
    assert_eq!(service.call_count("delete_index"), 0);
    let live = service.get_index(INDEX).await.unwrap().unwrap();
    assert!(live.field("owner").is_some());
    assert_eq!(ids(&service).len(), 5);
}

#[tokio::test]
async fn incompatible_schema_change_rebuilds() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    let mut desired = default_schema(INDEX, 0);
    for f in desired.fields.iter_mut().filter(|f| f.name == "start_line") {
        f.field_type = FieldType::String;
    }
    let c = controller_with_schema(&service, corpus(), manifest, desired);

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.plan.strategy, Strategy::FullRebuild { ref reason } if reason.contains("start_line")));
    assert_eq!(report.plan.steps, vec!["delete_index", "ensure_schema", "upload"]);
    assert!(report.is_completed());
    assert_eq!(service.call_count("delete_index"), 1);
    assert_eq!(report.batch.succeeded(), 5);
    let live = service.get_index(INDEX).await.unwrap().unwrap();
    assert_eq!(live.field("start_line").unwrap().field_type, FieldType::String);
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let service = Arc::new(InMemoryIndex::new());
    let automation = SchemaAutomation::new(service.clone());
    let desired = default_schema(INDEX, 8);

    let first = automation.ensure_schema(&desired).await.unwrap();
    assert!(first.updated);
    assert!(first.diff.index_missing);

    let second = automation.ensure_schema(&desired).await.unwrap();
    assert!(!second.updated);
    assert!(second.diff.is_empty());
    assert_eq!(service.call_count("create_or_update_index"), 1);
}

#[tokio::test]
async fn embeddings_are_filled_from_the_cache() {
    let service = Arc::new(InMemoryIndex::new());
    let provider = Arc::new(MockProvider::new(4));
    let cache = Arc::new(EmbeddingCache::new(
        provider.clone(),
        100,
        std::time::Duration::from_secs(60),
    ));

    let mut docs = corpus();
    // Same text in the same file as a1: one embedding serves both.
    docs.push(
        Document::new("a1-copy", "fn a1() {}")
            .with_field("repository", "alpha")
            .with_field("path", "alpha/a1.rs")
            .with_field("language", "rust"),
    );
    let c = controller_with_schema(&service, docs, Manifest::in_memory(), default_schema(INDEX, 4))
        .with_cache(cache.clone());

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.batch.succeeded(), 6);
    let stored = service.document(INDEX, "a1").unwrap();
    assert_eq!(stored[VECTOR_FIELD].as_array().map(|v| v.len()), Some(4));
    assert_eq!(stored[VECTOR_FIELD], service.document(INDEX, "a1-copy").unwrap()[VECTOR_FIELD]);
    assert_eq!(cache.len(), 5);
}

#[tokio::test]
async fn cancelled_run_reports_cancelled() {
    let service = Arc::new(InMemoryIndex::new());
    let c = controller(&service, corpus(), Manifest::in_memory());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = c.run(&ReindexRequest::default(), &cancel).await.unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert!(service.mutations().is_empty());
}

/// Corpus whose pass hit unreadable entries.
struct PartialCorpus {
    docs: VecCorpus,
    unreadable: usize,
}

impl Corpus for PartialCorpus {
    fn name(&self) -> &str {
        "partial"
    }

    fn documents(&self) -> BoxStream<'static, Document> {
        self.docs.documents()
    }

    fn read_errors(&self) -> usize {
        self.unreadable
    }
}

#[tokio::test]
async fn unreadable_corpus_entries_keep_vanished_documents() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;

    // b3 could not be read this time, so it is missing from the pass.
    let docs: Vec<Document> = corpus().into_iter().filter(|d| d.id != "b3").collect();
    let corpus = PartialCorpus {
        docs: VecCorpus::new("test", docs),
        unreadable: 1,
    };
    let c = ReindexController::new(service.clone(), Arc::new(corpus), default_schema(INDEX, 0))
        .with_pipeline_config(pipeline_config())
        .with_manifest(manifest);

    let preview = c
        .run(
            &ReindexRequest {
                dry_run: true,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(preview.plan.changes.map(|c| c.delete), Some(0));

    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.plan.strategy, Strategy::Incremental);
    assert!(report.is_completed());
    assert_eq!(report.corpus_read_errors, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(service.call_count("delete_documents"), 0);
    assert!(ids(&service).contains("b3"));
    assert!(c.manifest().get("b3").is_some());
    assert!(report.to_string().contains("1 unreadable entries"));
}

#[tokio::test]
async fn refused_vanished_delete_is_reported_and_remembered() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;
    service.reject_delete("b3");

    let docs: Vec<Document> = corpus().into_iter().filter(|d| !["b2", "b3"].contains(&d.id.as_str())).collect();
    let c = controller(&service, docs, manifest);
    let report = c
        .run(&ReindexRequest::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.deleted, 1);
    let refused: Vec<&str> = report.delete_failures.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(refused, vec!["b3"]);
    assert_eq!(report.delete_failures[0].error.as_deref(), Some("document is locked"));
    assert!(report.partial_failure().is_some());
    assert!(report.to_string().contains("deleted:  1 (1 failed)"));

    let manifest = c.manifest();
    assert!(manifest.get("b2").is_none());
    assert!(manifest.get("b3").is_some());
    assert_eq!(ids(&service), set(&["a1", "a2", "b1", "b3"]));
}

#[tokio::test]
async fn refused_scope_delete_stays_in_manifest() {
    let service = Arc::new(InMemoryIndex::new());
    let manifest = initial_load(&service).await;
    // An alpha document the manifest never saw, also locked.
    service
        .upload_documents(INDEX, &[doc("a9", "alpha", "fn a9() {}")])
        .await
        .unwrap();
    service.reject_delete("a2");
    service.reject_delete("a9");

    let docs: Vec<Document> = corpus().into_iter().filter(|d| d.id != "a2").collect();
    let c = controller(&service, docs, manifest);
    let scope = Scope::new("repository", "alpha");
    let request = ReindexRequest {
        scope: Some(scope.clone()),
        ..Default::default()
    };
    let report = c.run(&request, &CancellationToken::new()).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(report.deleted, 1);
    let refused: BTreeSet<String> = report.delete_failures.iter().map(|o| o.id.clone()).collect();
    assert_eq!(refused, set(&["a2", "a9"]));
    assert_eq!(report.batch.succeeded(), 1);

    let manifest = c.manifest();
    assert_eq!(manifest.ids(Some(&scope)), set(&["a1", "a2", "a9"]));
    assert!(manifest.get("a9").is_some_and(|e| e.hash.is_empty()));
    assert!(manifest.get("b1").is_some());
}

/// Cancels `cancel` from inside the first upload call.
struct CancelOnUpload {
    inner: Arc<InMemoryIndex>,
    cancel: CancellationToken,
}

#[async_trait]
impl SearchService for CancelOnUpload {
    async fn get_index(&self, name: &str) -> Result<Option<SchemaDefinition>> {
        self.inner.get_index(name).await
    }
    async fn list_indexes(&self) -> Result<Vec<String>> {
        self.inner.list_indexes().await
    }
    async fn create_or_update_index(&self, schema: &SchemaDefinition) -> Result<()> {
        self.inner.create_or_update_index(schema).await
    }
    async fn delete_index(&self, name: &str) -> Result<bool> {
        self.inner.delete_index(name).await
    }
    async fn index_statistics(&self, name: &str) -> Result<IndexStatistics> {
        self.inner.index_statistics(name).await
    }
    async fn upload_documents(&self, index: &str, docs: &[Document]) -> Result<Vec<IndexingResult>> {
        self.cancel.cancel();
        self.inner.upload_documents(index, docs).await
    }
    async fn delete_documents(&self, index: &str, keys: &[String]) -> Result<Vec<IndexingResult>> {
        self.inner.delete_documents(index, keys).await
    }
    async fn get_document(&self, index: &str, key: &str) -> Result<Option<Value>> {
        self.inner.get_document(index, key).await
    }
    async fn count_documents(&self, index: &str) -> Result<u64> {
        self.inner.count_documents(index).await
    }
    async fn search_keys(&self, index: &str, filter: &str, top: usize, skip: usize) -> Result<Vec<String>> {
        self.inner.search_keys(index, filter, top, skip).await
    }
    async fn create_or_update_indexer(&self, name: &str, definition: &Value) -> Result<()> {
        self.inner.create_or_update_indexer(name, definition).await
    }
    async fn run_indexer(&self, name: &str) -> Result<()> {
        self.inner.run_indexer(name).await
    }
    async fn reset_indexer(&self, name: &str) -> Result<()> {
        self.inner.reset_indexer(name).await
    }
    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus> {
        self.inner.indexer_status(name).await
    }
    async fn delete_indexer(&self, name: &str) -> Result<bool> {
        self.inner.delete_indexer(name).await
    }
    async fn create_or_update_data_source(&self, name: &str, definition: &Value) -> Result<()> {
        self.inner.create_or_update_data_source(name, definition).await
    }
    async fn get_data_source(&self, name: &str) -> Result<Option<Value>> {
        self.inner.get_data_source(name).await
    }
    async fn delete_data_source(&self, name: &str) -> Result<bool> {
        self.inner.delete_data_source(name).await
    }
    async fn create_or_update_skillset(&self, name: &str, definition: &Value) -> Result<()> {
        self.inner.create_or_update_skillset(name, definition).await
    }
    async fn get_skillset(&self, name: &str) -> Result<Option<Value>> {
        self.inner.get_skillset(name).await
    }
    async fn delete_skillset(&self, name: &str) -> Result<bool> {
        self.inner.delete_skillset(name).await
    }
}

#[tokio::test]
async fn cancel_during_upload_finishes_the_group_in_flight() {
    let inner = Arc::new(InMemoryIndex::new());
    let cancel = CancellationToken::new();
    let service = Arc::new(CancelOnUpload {
        inner: inner.clone(),
        cancel: cancel.clone(),
    });
    let c = ReindexController::new(
        service,
        Arc::new(VecCorpus::new("test", corpus())),
        default_schema(INDEX, 0),
    )
    .with_pipeline_config(PipelineConfig {
        workers: 1,
        ..pipeline_config()
    });

    let report = c.run(&ReindexRequest::default(), &cancel).await.unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(inner.call_count("upload_documents"), 1);
    assert_eq!(report.batch.groups, 1);
    let outcomes: Vec<&str> = report.batch.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(outcomes, vec!["a1", "a2"]);
    assert_eq!(report.batch.succeeded(), 2);
    assert_eq!(ids(&inner), set(&["a1", "a2"]));
    assert_eq!(c.manifest().len(), 2);
}
