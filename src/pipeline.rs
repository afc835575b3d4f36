//! Batched document upload.
//!
//! [`BatchPipeline::upload`] consumes a document stream in fixed-size
//! groups, fills in missing embeddings through the [`EmbeddingCache`], and
//! submits each group with the service's upload verb.
//!
//! # Flow
//!
//! ```text
//! stream ──chunks(batch_size)──▶ group ──enrich──▶ upload (retried) ──▶ outcomes
//!                                  │                                     │
//!                     at most `workers` groups in flight      cumulative totals
//! ```
//!
//! # Guarantees
//!
//! - One [`DocumentOutcome`] per document pulled from the stream.
//! - A failed group never stops the stream.
//! - At most `workers` groups are pulled ahead of completed uploads, so
//!   memory stays bounded by `workers × batch_size` documents.
//! - Groups may finish out of order; progress always reports cumulative
//!   totals.
//! - On cancellation no further group is pulled; groups already in flight
//!   run to completion.
//!
//! Documents whose embedding cannot be computed are marked failed and not
//! uploaded, so the next incremental run picks them up again.

use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::embed_cache::EmbeddingCache;
use crate::index_ops::{IndexingResult, SearchService};
use crate::models::{BatchResult, Document, DocumentOutcome};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::transport::RetryPolicy;

pub struct BatchPipeline {
    service: Arc<dyn SearchService>,
    cache: Option<Arc<EmbeddingCache>>,
    index: String,
    config: PipelineConfig,
    progress: Arc<dyn ProgressReporter>,
}

struct GroupResult {
    group: usize,
    size: usize,
    outcomes: Vec<DocumentOutcome>,
}

impl BatchPipeline {
    pub fn new(
        service: Arc<dyn SearchService>,
        cache: Option<Arc<EmbeddingCache>>,
        index: impl Into<String>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            service,
            cache,
            index: index.into(),
            config,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Upload every document in `docs`, stopping early only on cancellation.
    pub async fn upload(
        &self,
        docs: BoxStream<'_, Document>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let workers = self.config.workers.max(1);

        let mut groups = std::pin::pin!(docs
            .take_until(cancel.cancelled())
            .chunks(batch_size)
            .enumerate()
            .map(|(i, group)| self.process_group(i + 1, group))
            .buffer_unordered(workers));

        let mut result = BatchResult::default();
        while let Some(group) = groups.next().await {
            result.groups += 1;
            result.outcomes.extend(group.outcomes);
            let succeeded = result.succeeded();
            self.progress.report(&ProgressEvent::Group {
                index: self.index.clone(),
                group: group.group,
                group_size: group.size,
                succeeded,
                failed: result.total() - succeeded,
                elapsed: started.elapsed(),
            });
        }
        result.elapsed = started.elapsed();

        if cancel.is_cancelled() {
            warn!(index = %self.index, processed = result.total(), "upload cancelled");
        }
        info!(index = %self.index, "{}", result);
        self.progress.report(&ProgressEvent::Finished {
            index: self.index.clone(),
            succeeded: result.succeeded(),
            failed: result.failed(),
            elapsed: result.elapsed,
        });
        result
    }

    /// Enrich then upload one group. Every document gets exactly one outcome.
    async fn process_group(&self, group: usize, mut docs: Vec<Document>) -> GroupResult {
        let size = docs.len();
        debug!(index = %self.index, group, size, "processing group");

        let mut outcomes = Vec::with_capacity(size);
        let embed_failures = self.enrich(&mut docs).await;
        if !embed_failures.is_empty() {
            warn!(
                index = %self.index,
                group,
                failed = embed_failures.len(),
                "documents without embeddings will not be uploaded"
            );
            let mut failed = embed_failures.into_iter().peekable();
            let mut kept = Vec::with_capacity(docs.len());
            for (i, doc) in docs.into_iter().enumerate() {
                match failed.next_if(|(at, _)| *at == i) {
                    Some((_, reason)) => outcomes.push(DocumentOutcome::failure(
                        doc.id,
                        format!("embedding failed: {}", reason),
                    )),
                    None => kept.push(doc),
                }
            }
            docs = kept;
        }

        if !docs.is_empty() {
            outcomes.extend(self.upload_group(group, &docs).await);
        }

        GroupResult {
            group,
            size,
            outcomes,
        }
    }

    /// Fill missing embeddings; returns `(position, reason)` in group order
    /// for the documents that could not be embedded.
    async fn enrich(&self, docs: &mut [Document]) -> Vec<(usize, String)> {
        let Some(ref cache) = self.cache else {
            return Vec::new();
        };

        let pending: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        let items: Vec<(String, String)> = pending
            .iter()
            .map(|&i| (docs[i].content.clone(), docs[i].embedding_context()))
            .collect();

        match cache.get_or_compute_many(&items).await {
            Ok(vectors) => pending
                .into_iter()
                .zip(vectors)
                .filter_map(|(i, outcome)| match outcome {
                    Ok(vector) => {
                        docs[i].embedding = Some(vector);
                        None
                    }
                    Err(reason) => Some((i, reason)),
                })
                .collect(),
            Err(e) => {
                let reason = e.to_string();
                pending.into_iter().map(|i| (i, reason.clone())).collect()
            }
        }
    }

    /// Upload with whole-group retries on transient failures.
    async fn upload_group(&self, group: usize, docs: &[Document]) -> Vec<DocumentOutcome> {
        let backoff = Duration::from_millis(self.config.group_backoff_ms);
        let policy = RetryPolicy::new(self.config.group_attempts, backoff, backoff.saturating_mul(8));
        let label = format!("upload_documents({}, group {})", self.index, group);

        let response = policy
            .run(&label, |attempt| {
                if attempt > 1 {
                    info!(index = %self.index, group, attempt, "retrying group");
                }
                self.service.upload_documents(&self.index, docs)
            })
            .await;

        match response {
            Ok(results) => map_results(docs, results),
            Err(e) => {
                warn!(index = %self.index, group, error = %e, "group failed");
                let reason = e.to_string();
                docs.iter()
                    .map(|d| DocumentOutcome::failure(&d.id, reason.clone()))
                    .collect()
            }
        }
    }
}

/// One outcome per document, in document order. Keys missing from the
/// response count as failures. A key submitted twice takes its results in
/// order and reuses the last one when the service answered only once.
fn map_results(docs: &[Document], results: Vec<IndexingResult>) -> Vec<DocumentOutcome> {
    let mut by_key: HashMap<String, VecDeque<IndexingResult>> = HashMap::new();
    for r in results {
        by_key.entry(r.key.clone()).or_default().push_back(r);
    }
    docs.iter()
        .map(|doc| {
            let result = by_key.get_mut(&doc.id).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            match result {
                Some(r) => r.into_outcome(),
                None => DocumentOutcome::failure(&doc.id, "no result returned for document"),
            }
        })
        .collect()
}
