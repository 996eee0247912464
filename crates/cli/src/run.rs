//! Compute stage: assemble the dataset from caches or the model, then project it.

use anyhow::{Context, Result};
use diex_core::config::{AppConfig, ModelConfig};
use diex_core::folder::FolderSpec;
use diex_core::models::Dataset;
use diex_core::pipeline::{self, AssembleOptions, EmbeddingSource, FolderReport};
use diex_core::visualize::{self, Method, VisualizationResults};
use providers::{Device, Dinov2Embedder, ImageEmbedder};
use serde::Serialize;
use storage::EmbeddingCache;
use tracing::info;

/// Everything the session needs, plus what the summary reports.
pub struct ComputeOutput {
    pub dataset: Dataset,
    pub results: VisualizationResults,
    pub reports: Vec<FolderReport>,
    pub model_calls: usize,
    pub dim: usize,
}

pub fn compute_stage<L>(
    cfg: &AppConfig,
    folders: &[FolderSpec],
    force: bool,
    method: Method,
    load_embedder: L,
) -> Result<ComputeOutput>
where
    L: FnMut() -> Result<Box<dyn ImageEmbedder>>,
{
    let cache = EmbeddingCache::new(cfg.cache.resolved_root());
    info!(root = %cache.root().display(), folders = folders.len(), force, "Starting compute stage");
    let options = AssembleOptions {
        force,
        exclude: cfg.scan.exclude.clone(),
    };
    let assembled = pipeline::assemble(folders, &cache, &options, load_embedder)?;
    let results = visualize::compute_visualization(
        &assembled.dataset,
        &assembled.embeddings,
        method,
        cfg.viz.seed,
    )?;
    Ok(ComputeOutput {
        dim: assembled.embeddings.dim(),
        dataset: assembled.dataset,
        results,
        reports: assembled.reports,
        model_calls: assembled.model_calls,
    })
}

/// Loader for the configured DINOv2 checkpoint on `device`.
pub fn dinov2_loader(model: &ModelConfig, device: Device) -> impl FnMut() -> Result<Box<dyn ImageEmbedder>> {
    let model = model.clone();
    move || {
        let dtype = providers::parse_dtype(&model.dtype)?;
        let embedder = Dinov2Embedder::load(&model.repo, &model.revision, &device, dtype)
            .with_context(|| format!("failed to load {}@{}", model.repo, model.revision))?;
        Ok(Box::new(embedder) as Box<dyn ImageEmbedder>)
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub dataset: &'a str,
    pub brain_key: &'a str,
    pub method: Method,
    pub samples: usize,
    pub dim: usize,
    pub computed: usize,
    pub reused: usize,
    pub model_calls: usize,
    pub folders: &'a [FolderReport],
}

impl<'a> RunSummary<'a> {
    pub fn new(output: &'a ComputeOutput) -> Self {
        let count = |source: EmbeddingSource| -> usize {
            output
                .reports
                .iter()
                .filter(|r| r.source == source)
                .map(|r| r.samples)
                .sum()
        };
        Self {
            dataset: &output.dataset.name,
            brain_key: &output.results.brain_key,
            method: output.results.method,
            samples: output.dataset.len(),
            dim: output.dim,
            computed: count(EmbeddingSource::Computed),
            reused: count(EmbeddingSource::Cached),
            model_calls: output.model_calls,
            folders: &output.reports,
        }
    }
}
