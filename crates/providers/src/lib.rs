//! Provider abstractions for image embedding models.
//!
//! The pipeline only sees [`ImageEmbedder`]; the DINOv2 backend, its image
//! processor and the hub download live behind it.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod device;
pub mod dinov2;
pub mod hub;
pub mod processor;

pub use candle_core::{DType, Device};
pub use device::{parse_dtype, select_device};
pub use dinov2::Dinov2Embedder;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("model download failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid model configuration: {0}")]
    Config(String),
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Turns one image file into a flat feature vector.
///
/// Implementations must be deterministic for identical weights and bytes.
pub trait ImageEmbedder: Send + Sync {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, ProviderError>;
}
