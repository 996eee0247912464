//! Two-dimensional reductions of stacked embeddings.

mod knn;
mod pca;
mod tsne;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::pipeline::StackedEmbeddings;
use crate::visualize::Method;

/// Width the neighbour-based methods work in.
const PRE_REDUCED_DIM: usize = 50;
/// UMAP needs a full default neighbourhood (15) around every point.
const UMAP_MIN_ROWS: usize = 16;

/// Projects every row of `embeddings` to a point, in row order.
///
/// PCA and t-SNE are deterministic for a given `seed`. UMAP trains on the
/// default GPU backend and is not. Fewer than two rows map to the origin,
/// and datasets too small for a neighbourhood graph fall back to PCA.
pub fn reduce(method: Method, embeddings: &StackedEmbeddings, seed: u64) -> candle_core::Result<Vec<[f32; 2]>> {
    let rows = embeddings.rows();
    let dim = embeddings.dim();
    if rows < 2 || dim == 0 {
        return Ok(vec![[0.0, 0.0]; rows]);
    }
    let method = match method {
        Method::Tsne | Method::Umap if rows <= 3 => {
            info!(rows, requested = %method, "Too few samples for a neighbour graph; using pca");
            Method::Pca
        }
        Method::Umap if rows < UMAP_MIN_ROWS => {
            info!(rows, "Too few samples for umap; using pca");
            Method::Pca
        }
        other => other,
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let points = match method {
        Method::Pca => pairs(&pca::principal_components(embeddings.as_slice(), rows, dim, 2, &mut rng)?, 2),
        Method::Tsne | Method::Umap => {
            let width = PRE_REDUCED_DIM.min(dim);
            debug!(rows, dim, width, "pre-reducing with pca");
            let x = pca::principal_components(embeddings.as_slice(), rows, dim, width, &mut rng)?;
            if method == Method::Tsne {
                tsne::tsne(&x, rows, width, scale_to_std(pairs(&x, width), 1e-4))?
            } else {
                umap(&x, width)
            }
        }
    };
    Ok(points.into_iter().map(|[x, y]| [x as f32, y as f32]).collect())
}

fn umap(x: &[f64], width: usize) -> Vec<[f64; 2]> {
    let data: Vec<Vec<f64>> = x.chunks_exact(width).map(<[f64]>::to_vec).collect();
    let model = fast_umap::prelude::umap(data.clone());
    let projected: Vec<Vec<f64>> = model.transform(data);
    projected
        .iter()
        .map(|p| [p.first().copied().unwrap_or(0.0), p.get(1).copied().unwrap_or(0.0)])
        .collect()
}

/// The first two columns of a row-major matrix `width` wide.
fn pairs(m: &[f64], width: usize) -> Vec<[f64; 2]> {
    m.chunks_exact(width)
        .map(|row| [row[0], row.get(1).copied().unwrap_or(0.0)])
        .collect()
}

/// Rescales so the first coordinate has standard deviation `target`.
fn scale_to_std(mut points: Vec<[f64; 2]>, target: f64) -> Vec<[f64; 2]> {
    let n = points.len() as f64;
    let mean = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let std = (points.iter().map(|p| (p[0] - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std > 0.0 {
        for p in &mut points {
            p[0] *= target / std;
            p[1] *= target / std;
        }
    }
    points
}
