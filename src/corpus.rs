//! Source corpus abstraction.
//!
//! A [`Corpus`] yields the documents the index should contain. The
//! sequence is lazy and restartable: every call to
//! [`documents`](Corpus::documents) starts a fresh pass, and consumers
//! pull from it without random access.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

use crate::models::Document;

pub trait Corpus: Send + Sync {
    /// Label used in logs and reports.
    fn name(&self) -> &str;

    fn documents(&self) -> BoxStream<'static, Document>;

    /// Entries the most recent pass could not read. Documents behind them
    /// may still exist even though the pass did not yield them.
    fn read_errors(&self) -> usize {
        0
    }
}

/// A corpus held in memory.
#[derive(Clone)]
pub struct VecCorpus {
    name: String,
    docs: Arc<Vec<Document>>,
}

impl VecCorpus {
    pub fn new(name: impl Into<String>, docs: Vec<Document>) -> Self {
        Self {
            name: name.into(),
            docs: Arc::new(docs),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Corpus for VecCorpus {
    fn name(&self) -> &str {
        &self.name
    }

    fn documents(&self) -> BoxStream<'static, Document> {
        let docs = self.docs.clone();
        stream::iter(0..docs.len())
            .map(move |i| docs[i].clone())
            .boxed()
    }
}
