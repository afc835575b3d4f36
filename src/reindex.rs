//! Reindex orchestration.
//!
//! [`ReindexController`] reads the schema diff and a health snapshot,
//! picks a [`Strategy`] with the pure [`decide`] function, and then drives
//! schema automation and the batch pipeline to carry it out.
//!
//! # Decision order
//!
//! 1. The schema diff requires a rebuild → [`Strategy::FullRebuild`].
//! 2. The index is known to be empty, or its schema is known to be
//!    non-compliant → [`Strategy::FullRebuild`].
//! 3. A scope was requested → [`Strategy::FilteredClear`] (clear the scope,
//!    then upload it again).
//! 4. A full run was requested → reset and run the configured indexer, or
//!    [`Strategy::FullRebuild`] without one.
//! 5. An indexer is configured → [`Strategy::IndexerDelegated`].
//! 6. Otherwise → [`Strategy::Incremental`].
//!
//! # Execution
//!
//! | Strategy | Steps |
//! |----------|-------|
//! | FullRebuild | `delete_index` → `ensure_schema` → `upload` (whole corpus) |
//! | FilteredClear | `ensure_schema`* → `clear_scope` → `upload` (scope) |
//! | Incremental | `ensure_schema`* → `upload` (changed) → `delete_vanished` |
//! | IndexerDelegated | `ensure_schema`* → `reset_indexer`* → `run_indexer` → `indexer_status` |
//!
//! `*` only when needed. A failing step halts the run in
//! [`RunState::Failed`] with the partial [`BatchResult`] kept; nothing is
//! retried at this level. Dry runs stop after planning and never issue a
//! mutating call.
//!
//! Keys the service refuses to delete land in
//! [`ReindexReport::delete_failures`] and keep their manifest entries, so
//! a later run tries them again. `delete_vanished` is skipped when the
//! corpus pass reported unreadable entries.
//!
//! Changed documents are found by content hash against the [`Manifest`]
//! of the last successful uploads, unless the request names them.

use futures::stream::StreamExt;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{PipelineConfig, ReindexConfig};
use crate::corpus::Corpus;
use crate::embed_cache::EmbeddingCache;
use crate::error::{IndexError, Result};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::index_ops::{delete_matching, IndexerStatus, IndexingResult, SearchService};
use crate::manifest::{Manifest, ManifestEntry};
use crate::models::{BatchResult, Document, DocumentOutcome, Scope};
use crate::pipeline::BatchPipeline;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::schema::{SchemaAutomation, SchemaDefinition, SchemaDiff};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    FullRebuild { reason: String },
    FilteredClear { scope: Scope },
    Incremental,
    IndexerDelegated { indexer: String, reset: bool },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::FullRebuild { reason } => write!(f, "full-rebuild ({})", reason),
            Strategy::FilteredClear { scope } => write!(f, "filtered-clear ({})", scope),
            Strategy::Incremental => f.write_str("incremental"),
            Strategy::IndexerDelegated { indexer, reset } => {
                write!(f, "indexer-delegated ({}", indexer)?;
                if *reset {
                    f.write_str(", reset")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub schema_diff: &'a SchemaDiff,
    pub health: &'a HealthSnapshot,
    pub scope: Option<&'a Scope>,
    pub indexer: Option<&'a str>,
    pub force_full: bool,
}

/// Pick a strategy. Pure and deterministic.
pub fn decide(input: &DecisionInput<'_>) -> Strategy {
    if input.schema_diff.requires_rebuild() {
        return Strategy::FullRebuild {
            reason: format!("schema: {}", input.schema_diff.incompatible.join("; ")),
        };
    }
    if input.health.is_empty() {
        return Strategy::FullRebuild {
            reason: "index holds no documents".to_string(),
        };
    }
    if input.health.is_non_compliant() {
        return Strategy::FullRebuild {
            reason: "live schema is not compliant".to_string(),
        };
    }
    if let Some(scope) = input.scope {
        return Strategy::FilteredClear {
            scope: scope.clone(),
        };
    }
    match (input.force_full, input.indexer) {
        (true, Some(indexer)) => Strategy::IndexerDelegated {
            indexer: indexer.to_string(),
            reset: true,
        },
        (true, None) => Strategy::FullRebuild {
            reason: "full rebuild requested".to_string(),
        },
        (false, Some(indexer)) => Strategy::IndexerDelegated {
            indexer: indexer.to_string(),
            reset: false,
        },
        (false, None) => Strategy::Incremental,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReindexRequest {
    pub scope: Option<Scope>,
    pub dry_run: bool,
    pub force_full: bool,
    /// Upload exactly these ids instead of detecting changes.
    pub changed_ids: Option<BTreeSet<String>>,
}

/// What an upload strategy would touch, computed without mutating anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub upload: usize,
    pub unchanged: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexPlan {
    pub index: String,
    pub strategy: Strategy,
    pub schema_diff: SchemaDiff,
    pub health: HealthSnapshot,
    pub steps: Vec<String>,
    pub dry_run: bool,
    /// Filled in for dry runs of upload strategies.
    pub changes: Option<ChangeSummary>,
}

impl fmt::Display for ReindexPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "index:    {}", self.index)?;
        writeln!(f, "strategy: {}", self.strategy)?;
        writeln!(f, "schema:   {}", self.schema_diff.summary())?;
        writeln!(f, "steps:    {}", self.steps.join(" -> "))?;
        if let Some(ref c) = self.changes {
            writeln!(
                f,
                "changes:  {} to upload, {} unchanged, {} to delete",
                c.upload, c.unchanged, c.delete
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Completed,
    Failed { step: String, error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub plan: ReindexPlan,
    pub state: RunState,
    pub batch: BatchResult,
    pub schema_updated: bool,
    pub deleted: usize,
    /// Keys the service refused to delete. They stay in the manifest.
    pub delete_failures: Vec<DocumentOutcome>,
    /// Corpus entries that could not be read. When non-zero, vanished
    /// documents are not deleted.
    pub corpus_read_errors: usize,
    pub indexer_status: Option<IndexerStatus>,
}

impl ReindexReport {
    fn new(plan: ReindexPlan) -> Self {
        Self {
            plan,
            state: RunState::Completed,
            batch: BatchResult::default(),
            schema_updated: false,
            deleted: 0,
            delete_failures: Vec::new(),
            corpus_read_errors: 0,
            indexer_status: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Upload or delete failures of an otherwise completed run.
    pub fn partial_failure(&self) -> Option<IndexError> {
        if let Some(err) = self.batch.partial_failure("reindex") {
            return Some(err);
        }
        let failed = self.delete_failures.len();
        (failed > 0).then(|| IndexError::PartialBatch {
            operation: "delete_documents".to_string(),
            failed,
            total: self.deleted + failed,
        })
    }
}

impl fmt::Display for ReindexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.plan)?;
        match &self.state {
            RunState::Completed => writeln!(f, "state:    completed")?,
            RunState::Cancelled => writeln!(f, "state:    cancelled")?,
            RunState::Failed { step, error } => writeln!(f, "state:    failed at {}: {}", step, error)?,
        }
        if !self.plan.dry_run {
            writeln!(f, "upload:   {}", self.batch)?;
            write!(f, "deleted:  {}", self.deleted)?;
            if !self.delete_failures.is_empty() {
                write!(f, " ({} failed)", self.delete_failures.len())?;
            }
            writeln!(f)?;
            if self.corpus_read_errors > 0 {
                writeln!(
                    f,
                    "corpus:   {} unreadable entries, vanished documents kept",
                    self.corpus_read_errors
                )?;
            }
        }
        if let Some(ref status) = self.indexer_status {
            writeln!(f, "indexer:  {} ({})", status.name, status.status)?;
        }
        Ok(())
    }
}

/// Why execution stopped early.
enum Halt {
    Failed { step: &'static str, error: IndexError },
    Cancelled,
}

fn failed(step: &'static str) -> impl FnOnce(IndexError) -> Halt {
    move |error| Halt::Failed { step, error }
}

pub struct ReindexController {
    service: Arc<dyn SearchService>,
    corpus: Arc<dyn Corpus>,
    desired: SchemaDefinition,
    cache: Option<Arc<EmbeddingCache>>,
    pipeline_config: PipelineConfig,
    config: ReindexConfig,
    manifest: Mutex<Manifest>,
    progress: Arc<dyn ProgressReporter>,
}

impl ReindexController {
    pub fn new(service: Arc<dyn SearchService>, corpus: Arc<dyn Corpus>, desired: SchemaDefinition) -> Self {
        Self {
            service,
            corpus,
            desired,
            cache: None,
            pipeline_config: PipelineConfig::default(),
            config: ReindexConfig::default(),
            manifest: Mutex::new(Manifest::in_memory()),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }

    pub fn with_config(mut self, config: ReindexConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Mutex::new(manifest);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn index(&self) -> &str {
        &self.desired.name
    }

    /// Copy of the current manifest.
    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().unwrap().clone()
    }

    /// Read-only: diff the schema, snapshot health, and pick a strategy.
    pub async fn plan(&self, request: &ReindexRequest) -> Result<ReindexPlan> {
        let index = self.index().to_string();
        self.desired.validate()?;

        let schema_diff = SchemaAutomation::new(self.service.clone())
            .plan(&self.desired)
            .await?;
        let health = HealthMonitor::new(self.service.clone(), self.config.storage_quota_bytes)
            .snapshot(&index, Some(&self.desired))
            .await;

        let strategy = decide(&DecisionInput {
            schema_diff: &schema_diff,
            health: &health,
            scope: request.scope.as_ref(),
            indexer: self.config.indexer.as_deref(),
            force_full: request.force_full,
        });

        if let Strategy::FullRebuild { ref reason } = strategy {
            let destructive = !health.is_empty() && !request.force_full;
            if destructive && !self.config.allow_full_rebuild {
                return Err(IndexError::SchemaIncompatible {
                    index,
                    summary: format!("{} (full rebuilds are disabled)", reason),
                });
            }
        }

        let steps = self.steps_for(&strategy, &schema_diff, &health);
        info!(index = %index, strategy = %strategy, dry_run = request.dry_run, "reindex planned");
        self.progress.report(&ProgressEvent::Strategy {
            index: index.clone(),
            strategy: strategy.to_string(),
            dry_run: request.dry_run,
        });

        Ok(ReindexPlan {
            index,
            strategy,
            schema_diff,
            health,
            steps,
            dry_run: request.dry_run,
            changes: None,
        })
    }

    fn steps_for(&self, strategy: &Strategy, diff: &SchemaDiff, health: &HealthSnapshot) -> Vec<String> {
        let schema_step = (!diff.is_empty()).then_some("ensure_schema");
        let steps: Vec<Option<&str>> = match strategy {
            Strategy::FullRebuild { .. } => vec![
                (health.exists != Some(false)).then_some("delete_index"),
                Some("ensure_schema"),
                Some("upload"),
            ],
            Strategy::FilteredClear { .. } => vec![schema_step, Some("clear_scope"), Some("upload")],
            Strategy::Incremental => vec![schema_step, Some("upload"), Some("delete_vanished")],
            Strategy::IndexerDelegated { reset, .. } => vec![
                schema_step,
                reset.then_some("reset_indexer"),
                Some("run_indexer"),
                Some("indexer_status"),
            ],
        };
        steps.into_iter().flatten().map(String::from).collect()
    }

    /// Plan, then execute unless `request.dry_run`.
    ///
    /// Returns `Err` only when planning fails. Execution failures are
    /// reported through [`ReindexReport::state`].
    pub async fn run(&self, request: &ReindexRequest, cancel: &CancellationToken) -> Result<ReindexReport> {
        let mut plan = self.plan(request).await?;

        if request.dry_run {
            plan.changes = self.preview(&plan.strategy, request).await;
            return Ok(ReindexReport::new(plan));
        }

        let mut report = ReindexReport::new(plan);
        let mut manifest = self.manifest();

        let outcome = self.execute(request, &mut report, &mut manifest, cancel).await;
        report.state = match outcome {
            Ok(()) if cancel.is_cancelled() => RunState::Cancelled,
            Ok(()) => RunState::Completed,
            Err(Halt::Cancelled) => RunState::Cancelled,
            Err(Halt::Failed { step, error }) => {
                error!(index = %report.plan.index, step, error = %error, "reindex failed");
                RunState::Failed {
                    step: step.to_string(),
                    error: error.to_string(),
                }
            }
        };

        if let Err(e) = manifest.save() {
            warn!(error = %e, "failed to save manifest");
            if report.state == RunState::Completed {
                report.state = RunState::Failed {
                    step: "save_manifest".to_string(),
                    error: e.to_string(),
                };
            }
        }
        *self.manifest.lock().unwrap() = manifest;

        info!(
            index = %report.plan.index,
            state = ?report.state,
            succeeded = report.batch.succeeded(),
            failed = report.batch.failed(),
            deleted = report.deleted,
            delete_failed = report.delete_failures.len(),
            "reindex finished"
        );
        Ok(report)
    }

    fn step(&self, name: &str, cancel: &CancellationToken) -> std::result::Result<(), Halt> {
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        info!(index = %self.index(), step = name, "reindex step");
        self.progress.report(&ProgressEvent::Step {
            index: self.index().to_string(),
            step: name.to_string(),
        });
        Ok(())
    }

    async fn execute(
        &self,
        request: &ReindexRequest,
        report: &mut ReindexReport,
        manifest: &mut Manifest,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        let strategy = report.plan.strategy.clone();
        let schema_changed = !report.plan.schema_diff.is_empty();

        match strategy {
            Strategy::FullRebuild { .. } => {
                if report.plan.health.exists != Some(false) {
                    self.step("delete_index", cancel)?;
                    self.service
                        .delete_index(self.index())
                        .await
                        .map_err(failed("delete_index"))?;
                }
                manifest.clear();
                self.ensure_schema(report, cancel).await?;
                self.upload(None, &UploadFilter::All, report, manifest, cancel)
                    .await?;
            }
            Strategy::FilteredClear { ref scope } => {
                if schema_changed {
                    self.ensure_schema(report, cancel).await?;
                }
                self.step("clear_scope", cancel)?;
                let results = delete_matching(
                    self.service.as_ref(),
                    self.index(),
                    &scope.filter_expression(),
                    self.pipeline_config.batch_size,
                )
                .await
                .map_err(failed("clear_scope"))?;
                let kept: Vec<(String, ManifestEntry)> = self
                    .tally_deletes(report, results)
                    .into_iter()
                    .map(|id| {
                        let entry = manifest
                            .get(&id)
                            .cloned()
                            .unwrap_or_else(|| ManifestEntry::untracked(scope));
                        (id, entry)
                    })
                    .collect();
                manifest.clear_scope(scope);
                for (id, entry) in kept {
                    manifest.record(id, entry);
                }
                self.upload(Some(scope), &UploadFilter::All, report, manifest, cancel)
                    .await?;
            }
            Strategy::Incremental => {
                if schema_changed {
                    self.ensure_schema(report, cancel).await?;
                }
                let filter = match request.changed_ids {
                    Some(ref ids) => UploadFilter::Ids(ids.clone()),
                    None => UploadFilter::Changed(manifest.clone()),
                };
                let seen = self.upload(None, &filter, report, manifest, cancel).await?;

                report.corpus_read_errors = self.corpus.read_errors();
                if report.corpus_read_errors > 0 {
                    warn!(
                        index = %self.index(),
                        corpus = %self.corpus.name(),
                        unreadable = report.corpus_read_errors,
                        "corpus pass was incomplete, not deleting vanished documents"
                    );
                } else if request.changed_ids.is_none() && !cancel.is_cancelled() {
                    let vanished: Vec<String> = manifest
                        .ids(None)
                        .into_iter()
                        .filter(|id| !seen.contains(id))
                        .collect();
                    if !vanished.is_empty() {
                        self.step("delete_vanished", cancel)?;
                        let results = self
                            .delete_keys(&vanished)
                            .await
                            .map_err(failed("delete_vanished"))?;
                        for r in results.iter().filter(|r| r.status) {
                            manifest.remove(&r.key);
                        }
                        self.tally_deletes(report, results);
                    }
                }
            }
            Strategy::IndexerDelegated { ref indexer, reset } => {
                if schema_changed {
                    self.ensure_schema(report, cancel).await?;
                }
                if reset {
                    self.step("reset_indexer", cancel)?;
                    self.service
                        .reset_indexer(indexer)
                        .await
                        .map_err(failed("reset_indexer"))?;
                }
                self.step("run_indexer", cancel)?;
                self.service
                    .run_indexer(indexer)
                    .await
                    .map_err(failed("run_indexer"))?;
                self.step("indexer_status", cancel)?;
                match self.service.indexer_status(indexer).await {
                    Ok(status) => report.indexer_status = Some(status),
                    Err(e) => warn!(indexer = %indexer, error = %e, "could not read indexer status"),
                }
            }
        }
        Ok(())
    }

    async fn ensure_schema(&self, report: &mut ReindexReport, cancel: &CancellationToken) -> std::result::Result<(), Halt> {
        self.step("ensure_schema", cancel)?;
        let schema_report = SchemaAutomation::new(self.service.clone())
            .ensure_schema(&self.desired)
            .await
            .map_err(failed("ensure_schema"))?;
        report.schema_updated |= schema_report.updated;
        schema_report
            .into_result(self.index())
            .map_err(failed("ensure_schema"))?;
        Ok(())
    }

    /// Stream the corpus through the pipeline. Returns every id seen in
    /// the (scoped) corpus, uploaded or not.
    async fn upload(
        &self,
        scope: Option<&Scope>,
        filter: &UploadFilter,
        report: &mut ReindexReport,
        manifest: &mut Manifest,
        cancel: &CancellationToken,
    ) -> std::result::Result<BTreeSet<String>, Halt> {
        self.step("upload", cancel)?;

        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let docs = {
            let scope = scope.cloned();
            let filter = filter.clone();
            let seen = seen.clone();
            let pending = pending.clone();
            self.corpus
                .documents()
                .filter(move |doc| {
                    let keep = scope.as_ref().map_or(true, |s| s.matches(doc)) && {
                        seen.lock().unwrap().insert(doc.id.clone());
                        filter.wants(doc)
                    };
                    if keep {
                        pending
                            .lock()
                            .unwrap()
                            .insert(doc.id.clone(), ManifestEntry::from_document(doc));
                    }
                    futures::future::ready(keep)
                })
                .boxed()
        };

        let pipeline = BatchPipeline::new(
            self.service.clone(),
            self.cache.clone(),
            self.index(),
            self.pipeline_config.clone(),
        )
        .with_progress(self.progress.clone());
        let batch = pipeline.upload(docs, cancel).await;

        let mut pending = std::mem::take(&mut *pending.lock().unwrap());
        for outcome in batch.outcomes.iter().filter(|o| o.is_success()) {
            if let Some(entry) = pending.remove(&outcome.id) {
                manifest.record(outcome.id.clone(), entry);
            }
        }
        if batch.failed() > 0 {
            warn!(index = %self.index(), failed = batch.failed(), "some documents failed to upload");
        }
        report.batch.extend(batch);

        let seen = std::mem::take(&mut *seen.lock().unwrap());
        Ok(seen)
    }

    /// Delete `keys` in pipeline-sized chunks; one result per key.
    async fn delete_keys(&self, keys: &[String]) -> Result<Vec<IndexingResult>> {
        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.pipeline_config.batch_size.max(1)) {
            let chunk_results = self
                .service
                .delete_documents(self.index(), chunk)
                .await
                .map_err(|e| e.annotate(format!("delete_documents({})", self.index())))?;
            results.extend(chunk_results);
        }
        Ok(results)
    }

    /// Count successful deletes and record refusals on the report.
    /// Returns the keys that are still in the index.
    fn tally_deletes(&self, report: &mut ReindexReport, results: Vec<IndexingResult>) -> Vec<String> {
        let mut refused = Vec::new();
        for outcome in results.into_iter().map(IndexingResult::into_outcome) {
            if outcome.is_success() {
                report.deleted += 1;
                continue;
            }
            warn!(
                index = %self.index(),
                key = %outcome.id,
                reason = outcome.error.as_deref().unwrap_or_default(),
                "delete refused"
            );
            refused.push(outcome.id.clone());
            report.delete_failures.push(outcome);
        }
        refused
    }

    /// Count what an upload strategy would send and delete.
    async fn preview(&self, strategy: &Strategy, request: &ReindexRequest) -> Option<ChangeSummary> {
        let manifest = self.manifest();
        let (scope, filter) = match strategy {
            Strategy::IndexerDelegated { .. } => return None,
            Strategy::FullRebuild { .. } => (None, UploadFilter::All),
            Strategy::FilteredClear { scope } => (Some(scope.clone()), UploadFilter::All),
            Strategy::Incremental => match request.changed_ids {
                Some(ref ids) => (None, UploadFilter::Ids(ids.clone())),
                None => (None, UploadFilter::Changed(manifest.clone())),
            },
        };

        let mut summary = ChangeSummary::default();
        let mut seen = BTreeSet::new();
        let mut docs = self.corpus.documents();
        while let Some(doc) = docs.next().await {
            if scope.as_ref().is_some_and(|s| !s.matches(&doc)) {
                continue;
            }
            seen.insert(doc.id.clone());
            if filter.wants(&doc) {
                summary.upload += 1;
            } else {
                summary.unchanged += 1;
            }
        }
        let complete = self.corpus.read_errors() == 0;
        if matches!(strategy, Strategy::Incremental) && request.changed_ids.is_none() && complete {
            summary.delete = manifest.ids(None).difference(&seen).count();
        }
        Some(summary)
    }
}

/// Which corpus documents an upload sends.
#[derive(Clone)]
enum UploadFilter {
    All,
    Ids(BTreeSet<String>),
    /// Documents whose hash differs from this manifest.
    Changed(Manifest),
}

impl UploadFilter {
    fn wants(&self, doc: &Document) -> bool {
        match self {
            UploadFilter::All => true,
            UploadFilter::Ids(ids) => ids.contains(&doc.id),
            UploadFilter::Changed(manifest) => !manifest.is_unchanged(doc),
        }
    }
}
