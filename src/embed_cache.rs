//! Content-addressed embedding cache.
//!
//! Maps `(text, context)` → vector in front of an [`EmbeddingProvider`].
//! Entries expire after a TTL (measured from creation) and the least
//! recently accessed entries are evicted whenever an insert pushes the
//! cache over capacity.
//!
//! ## Thread Safety
//!
//! The LRU map and its bookkeeping sit behind one `Mutex`, so eviction
//! never races a concurrent lookup. The lock is never held across a
//! provider call: concurrent misses for the same key may both reach the
//! provider, and the later insert wins.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{IndexError, Result};

/// Per-item result of [`EmbeddingCache::get_or_compute_many`].
pub type EmbedOutcome = std::result::Result<Vec<f32>, String>;

struct CacheEntry {
    vector: Vec<f32>,
    created_at: Instant,
    last_access: Instant,
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache key: SHA-256 of text and context separated by a NUL byte.
pub fn cache_key(text: &str, context: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, capacity: usize, ttl: Duration) -> Self {
        Self {
            provider,
            entries: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fresh entry exists, without touching its recency.
    pub fn contains(&self, text: &str, context: &str) -> bool {
        let key = cache_key(text, context);
        let entries = self.entries.lock().unwrap();
        entries
            .peek(&key)
            .is_some_and(|e| e.created_at.elapsed() < self.ttl)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Fresh cached vector for `key`, refreshing its last-access time.
    /// A stale entry is dropped and reported as absent.
    fn lookup(&self, entries: &mut LruCache<String, CacheEntry>, key: &str) -> Option<Vec<f32>> {
        let now = Instant::now();
        let fresh = match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.created_at) < self.ttl => {
                entry.last_access = now;
                Some(entry.vector.clone())
            }
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            entries.pop(key);
        }
        fresh
    }

    fn insert(&self, entries: &mut LruCache<String, CacheEntry>, key: String, vector: Vec<f32>) {
        let now = Instant::now();
        entries.put(
            key,
            CacheEntry {
                vector,
                created_at: now,
                last_access: now,
            },
        );
        while entries.len() > self.capacity {
            if let Some((evicted, entry)) = entries.pop_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %&evicted[..12],
                    idle_ms = entry.last_access.elapsed().as_millis() as u64,
                    "evicted embedding"
                );
            }
        }
    }

    /// Cached vector for `(text, context)`, computing it on a miss.
    pub async fn get_or_compute(&self, text: &str, context: &str) -> Result<Vec<f32>> {
        let key = cache_key(text, context);
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(vector) = self.lookup(&mut entries, &key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(vector);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut vectors = self.provider.embed_batch(&[text.to_string()]).await?;
        let vector = vectors.pop().ok_or_else(|| IndexError::ProviderUnavailable {
            provider: self.provider.model_name().to_string(),
            message: "provider returned no vector".to_string(),
        })?;
        let mut entries = self.entries.lock().unwrap();
        self.insert(&mut entries, key, vector.clone());
        Ok(vector)
    }

    /// Batch lookup over `(text, context)` pairs.
    ///
    /// All misses (deduplicated by key) go to the provider in a single
    /// call, and results come back in input order. If that call fails,
    /// hits are still returned and each miss carries the failure reason.
    /// The error propagates only when every item was a miss.
    pub async fn get_or_compute_many(&self, items: &[(String, String)]) -> Result<Vec<EmbedOutcome>> {
        let keys: Vec<String> = items.iter().map(|(t, c)| cache_key(t, c)).collect();
        let mut results: Vec<Option<EmbedOutcome>> = vec![None; items.len()];

        // key → position in `miss_texts`
        let mut miss_slots: HashMap<&str, usize> = HashMap::new();
        let mut miss_keys: Vec<String> = Vec::new();
        let mut miss_texts: Vec<String> = Vec::new();
        let mut hit_count = 0usize;
        {
            let mut entries = self.entries.lock().unwrap();
            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = self.lookup(&mut entries, key) {
                    results[i] = Some(Ok(vector));
                    hit_count += 1;
                } else if !miss_slots.contains_key(key.as_str()) {
                    miss_slots.insert(key.as_str(), miss_texts.len());
                    miss_keys.push(key.clone());
                    miss_texts.push(items[i].0.clone());
                }
            }
        }
        self.hits.fetch_add(hit_count as u64, Ordering::Relaxed);
        self.misses
            .fetch_add((items.len() - hit_count) as u64, Ordering::Relaxed);

        if miss_texts.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        debug!(hits = hit_count, misses = miss_texts.len(), "embedding batch");
        let computed = match self.provider.embed_batch(&miss_texts).await {
            Ok(vectors) if vectors.len() == miss_texts.len() => Ok(vectors),
            Ok(vectors) => Err(IndexError::ProviderUnavailable {
                provider: self.provider.model_name().to_string(),
                message: format!("expected {} vectors, got {}", miss_texts.len(), vectors.len()),
            }),
            Err(e) => Err(e),
        };

        match computed {
            Ok(vectors) => {
                let mut entries = self.entries.lock().unwrap();
                for (key, vector) in miss_keys.iter().zip(&vectors) {
                    self.insert(&mut entries, key.clone(), vector.clone());
                }
                drop(entries);
                for (i, key) in keys.iter().enumerate() {
                    if results[i].is_none() {
                        let slot = miss_slots[key.as_str()];
                        results[i] = Some(Ok(vectors[slot].clone()));
                    }
                }
            }
            Err(e) if hit_count == 0 => return Err(e),
            Err(e) => {
                warn!(
                    hits = hit_count,
                    misses = miss_texts.len(),
                    error = %e,
                    "embedding provider failed; returning cached vectors only"
                );
                let reason = e.to_string();
                for slot in results.iter_mut().filter(|r| r.is_none()) {
                    *slot = Some(Err(reason.clone()));
                }
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
