//! Dataset assembly: cache lookup, lazy embedding, cache write-back and
//! row-aligned stacking, folder by folder in argument order.

use anyhow::Context;
use providers::ImageEmbedder;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use storage::{EmbeddingCache, EmbeddingMap};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::folder::{self, FolderSpec};
use crate::models::Dataset;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot derive a folder identity from {0:?}")]
    NoIdentity(String),
    #[error("cached embeddings for {identity} have no entry for {file}; rerun with --force")]
    MissingCachedEmbedding { identity: String, file: String },
    #[error("embedding for {file} has {found} values, expected {expected}")]
    DimensionMismatch {
        file: String,
        expected: usize,
        found: usize,
    },
    #[error("{samples} samples but {rows} embedding rows")]
    RowMismatch { samples: usize, rows: usize },
}

#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    /// Recompute and overwrite every folder's cache.
    pub force: bool,
    /// File-name globs skipped by the folder listing.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Computed,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderReport {
    pub identity: String,
    pub path: PathBuf,
    pub source: EmbeddingSource,
    pub samples: usize,
    pub cache_file: PathBuf,
}

/// All input vectors stacked row-major, one row per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StackedEmbeddings {
    data: Vec<f32>,
    rows: usize,
    dim: usize,
}

impl StackedEmbeddings {
    /// Stacks `rows` in order. Every row must have the same length.
    pub fn stack(rows: Vec<(String, Vec<f32>)>) -> Result<Self, PipelineError> {
        let dim = rows.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dim);
        let count = rows.len();
        for (file, row) in rows {
            if row.len() != dim {
                return Err(PipelineError::DimensionMismatch {
                    file,
                    expected: dim,
                    found: row.len(),
                });
            }
            data.extend_from_slice(&row);
        }
        Ok(Self {
            data,
            rows: count,
            dim,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.rows {
            return None;
        }
        Some(&self.data[index * self.dim..(index + 1) * self.dim])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Output of the compute stage.
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    pub dataset: Dataset,
    pub embeddings: StackedEmbeddings,
    pub reports: Vec<FolderReport>,
    /// Number of images passed through the model in this run.
    pub model_calls: usize,
}

/// Loads the embedder on first use and keeps it for the rest of the run.
struct LazyEmbedder<L> {
    load: L,
    loaded: Option<Box<dyn ImageEmbedder>>,
}

impl<L> LazyEmbedder<L>
where
    L: FnMut() -> anyhow::Result<Box<dyn ImageEmbedder>>,
{
    fn new(load: L) -> Self {
        Self { load, loaded: None }
    }

    fn get(&mut self) -> anyhow::Result<&dyn ImageEmbedder> {
        let embedder = match self.loaded.take() {
            Some(embedder) => embedder,
            None => {
                info!("Loading embedding model");
                (self.load)().context("failed to load embedding model")?
            }
        };
        Ok(&**self.loaded.insert(embedder))
    }
}

/// Builds the dataset and its stacked embeddings for `folders`.
///
/// `load_embedder` runs at most once, and only if some folder has no usable
/// cache. A cached mapping that lacks a listed file is an error.
pub fn assemble<L>(
    folders: &[FolderSpec],
    cache: &EmbeddingCache,
    options: &AssembleOptions,
    load_embedder: L,
) -> anyhow::Result<AssembledDataset>
where
    L: FnMut() -> anyhow::Result<Box<dyn ImageEmbedder>>,
{
    warn_on_shared_identities(folders);
    let excludes = folder::build_globset(&options.exclude)?;
    let mut embedder = LazyEmbedder::new(load_embedder);
    let mut dataset = Dataset::new();
    let mut rows: Vec<(String, Vec<f32>)> = Vec::new();
    let mut reports = Vec::with_capacity(folders.len());
    let mut model_calls = 0usize;

    for spec in folders {
        let identity = spec.identity.as_str();
        let cached = if options.force {
            None
        } else {
            cache
                .fetch(identity)
                .with_context(|| format!("failed to read cache for {identity}"))?
        };
        let files = folder::list_files(&spec.path, &excludes)?;

        let source = match cached {
            None => {
                info!(folder = identity, files = files.len(), "Generating embeddings");
                let model = embedder.get()?;
                let mut computed = EmbeddingMap::with_capacity(files.len());
                for path in &files {
                    let key = folder::file_key(path)?;
                    debug!(file = %path.display(), "embedding");
                    let vector = model
                        .embed(path)
                        .with_context(|| format!("failed to embed {}", path.display()))?;
                    model_calls += 1;
                    rows.push((path.display().to_string(), vector.clone()));
                    computed.insert(key, vector);
                    dataset.add_sample(path.clone(), identity);
                }
                let written = cache
                    .store(identity, &computed)
                    .with_context(|| format!("failed to write cache for {identity}"))?;
                debug!(folder = identity, path = %written.display(), "cache written");
                EmbeddingSource::Computed
            }
            Some(mut cached) => {
                info!(folder = identity, files = files.len(), "Using cached embeddings");
                for path in &files {
                    let key = folder::file_key(path)?;
                    let vector =
                        cached
                            .remove(&key)
                            .ok_or_else(|| PipelineError::MissingCachedEmbedding {
                                identity: identity.to_string(),
                                file: key.clone(),
                            })?;
                    rows.push((path.display().to_string(), vector));
                    dataset.add_sample(path.clone(), identity);
                }
                EmbeddingSource::Cached
            }
        };

        reports.push(FolderReport {
            identity: identity.to_string(),
            path: spec.path.clone(),
            source,
            samples: files.len(),
            cache_file: cache.entry_path(identity)?,
        });
    }

    let embeddings = StackedEmbeddings::stack(rows)?;
    if embeddings.rows() != dataset.len() {
        return Err(PipelineError::RowMismatch {
            samples: dataset.len(),
            rows: embeddings.rows(),
        }
        .into());
    }
    info!(
        samples = dataset.len(),
        dim = embeddings.dim(),
        model_calls,
        "Dataset assembled"
    );
    Ok(AssembledDataset {
        dataset,
        embeddings,
        reports,
        model_calls,
    })
}

fn warn_on_shared_identities(folders: &[FolderSpec]) {
    let mut seen: HashMap<&str, &PathBuf> = HashMap::new();
    for spec in folders {
        if let Some(first) = seen.insert(spec.identity.as_str(), &spec.path) {
            if first != &spec.path {
                warn!(
                    identity = %spec.identity,
                    first = %first.display(),
                    second = %spec.path.display(),
                    "folders share an identity; they share one cache entry and tag"
                );
            }
        }
    }
}
