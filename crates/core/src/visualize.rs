use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::models::Dataset;
use crate::pipeline::{PipelineError, StackedEmbeddings};
use crate::reduce;

/// Key under which the 2-D results are attached to a dataset.
pub const BRAIN_KEY: &str = "img_viz";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Umap,
    Tsne,
    Pca,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Umap => "umap",
            Method::Tsne => "tsne",
            Method::Pca => "pca",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "umap" => Ok(Method::Umap),
            "tsne" => Ok(Method::Tsne),
            "pca" => Ok(Method::Pca),
            other => Err(format!("unknown method {other:?}; expected umap, tsne or pca")),
        }
    }
}

/// One point per sample, in dataset order.
#[derive(Debug, Clone, Serialize)]
pub struct VisualizationResults {
    pub brain_key: String,
    pub method: Method,
    pub points: Vec<[f32; 2]>,
}

pub fn compute_visualization(
    dataset: &Dataset,
    embeddings: &StackedEmbeddings,
    method: Method,
    seed: u64,
) -> anyhow::Result<VisualizationResults> {
    if dataset.len() != embeddings.rows() {
        return Err(PipelineError::RowMismatch {
            samples: dataset.len(),
            rows: embeddings.rows(),
        }
        .into());
    }
    info!(%method, samples = dataset.len(), dim = embeddings.dim(), "Computing visualization");
    let points = reduce::reduce(method, embeddings, seed).context("projection failed")?;
    Ok(VisualizationResults {
        brain_key: BRAIN_KEY.to_string(),
        method,
        points,
    })
}
