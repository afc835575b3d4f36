use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::corpus::Corpus;
use crate::models::{stable_id, Document};

/// One document per matching file under a root directory.
///
/// Files are walked lazily in file-name order on every pass. Files that
/// are not valid UTF-8 or exceed `max_file_bytes` are skipped. Entries
/// that fail with an I/O error are counted in
/// [`read_errors`](Corpus::read_errors) for the pass.
pub struct FilesystemCorpus {
    name: String,
    inner: Arc<Walker>,
}

struct Walker {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    repository: Option<String>,
    max_file_bytes: u64,
    read_errors: AtomicUsize,
}

impl FilesystemCorpus {
    pub fn new(config: &CorpusConfig) -> Result<Self> {
        let root = &config.root;
        if !root.exists() {
            bail!("Corpus root does not exist: {}", root.display());
        }

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            name: format!("filesystem:{}", root.display()),
            inner: Arc::new(Walker {
                root: root.clone(),
                include: build_globset(&config.include_globs)?,
                exclude: build_globset(&default_excludes)?,
                follow_symlinks: config.follow_symlinks,
                repository: config.repository.clone(),
                max_file_bytes: config.max_file_bytes,
                read_errors: AtomicUsize::new(0),
            }),
        })
    }
}

impl Corpus for FilesystemCorpus {
    fn name(&self) -> &str {
        &self.name
    }

    fn documents(&self) -> BoxStream<'static, Document> {
        let walker = self.inner.clone();
        walker.read_errors.store(0, Ordering::Relaxed);
        let entries = WalkDir::new(&walker.root)
            .follow_links(walker.follow_symlinks)
            .sort_by_file_name()
            .into_iter();

        stream::iter(entries)
            .filter_map(move |entry| {
                let loaded = match entry {
                    Ok(entry) if entry.file_type().is_file() => walker.load(entry.path()),
                    Ok(_) => Ok(None),
                    Err(e) => Err(io::Error::from(e)),
                };
                let doc = loaded.unwrap_or_else(|e| {
                    walker.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(root = %walker.root.display(), error = %e, "unreadable corpus entry");
                    None
                });
                futures::future::ready(doc)
            })
            .boxed()
    }

    fn read_errors(&self) -> usize {
        self.inner.read_errors.load(Ordering::Relaxed)
    }
}

impl Walker {
    /// `Ok(None)` for files that are not candidates; `Err` when a
    /// candidate could not be read.
    fn load(&self, path: &Path) -> io::Result<Option<Document>> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
            return Ok(None);
        }

        let metadata = std::fs::metadata(path)?;
        if metadata.len() > self.max_file_bytes {
            debug!(path = %rel_str, size = metadata.len(), "skipping large file");
            return Ok(None);
        }
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                debug!(path = %rel_str, "skipping non-text file");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let repository = self.repository.as_deref().unwrap_or_default();
        let lines = body.lines().count().max(1) as i64;
        let mut doc = Document::new(stable_id(&[repository, rel_str.as_str()]), body)
            .with_field("path", rel_str.clone())
            .with_field("start_line", 1)
            .with_field("end_line", lines);
        if let Some(language) = language_for(&rel_str) {
            doc = doc.with_field("language", language);
        }
        if !repository.is_empty() {
            doc = doc.with_field("repository", repository);
        }
        doc.last_modified = modified;
        Ok(Some(doc))
    }
}

/// Language label from the file extension.
fn language_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    Some(match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "cs" => "csharp",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "rb" => "ruby",
        "md" => "markdown",
        "toml" => "toml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        _ => return None,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
