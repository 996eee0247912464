//! Storage layer: the on-disk embedding cache.
//!
//! Every folder identity owns one directory under the cache root holding a
//! single safetensors file. Each tensor in that file is one image's embedding,
//! keyed by the image's file name.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of the serialized mapping inside a folder's cache directory.
pub const CACHE_FILE_NAME: &str = "embeddings.safetensors";

/// File name -> flattened embedding for one folder.
pub type EmbeddingMap = HashMap<String, Vec<f32>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid cache identity {0:?}")]
    InvalidIdentity(String),
    #[error("cache io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file {path} could not be decoded: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
    #[error("embedding for {key} could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: candle_core::Error,
    },
}

/// Handle on a cache root. Holds no open files; every call hits the disk.
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    root: PathBuf,
}

impl EmbeddingCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the cache of one folder identity.
    pub fn folder_dir(&self, identity: &str) -> Result<PathBuf, StorageError> {
        validate_identity(identity)?;
        Ok(self.root.join(identity))
    }

    /// Location of the serialized mapping for one folder identity.
    pub fn entry_path(&self, identity: &str) -> Result<PathBuf, StorageError> {
        Ok(self.folder_dir(identity)?.join(CACHE_FILE_NAME))
    }

    /// Loads the full mapping for `identity`, or `None` when nothing was cached.
    pub fn fetch(&self, identity: &str) -> Result<Option<EmbeddingMap>, StorageError> {
        let path = self.entry_path(identity)?;
        if !path.is_file() {
            debug!(identity, path = %path.display(), "no cached embeddings");
            return Ok(None);
        }
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu).map_err(|source| {
            StorageError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        let mut embeddings = EmbeddingMap::with_capacity(tensors.len());
        for (key, tensor) in tensors {
            let vector = tensor_to_vec(&tensor).map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?;
            embeddings.insert(key, vector);
        }
        debug!(identity, entries = embeddings.len(), "loaded cached embeddings");
        Ok(Some(embeddings))
    }

    /// Replaces the cached mapping for `identity` with `embeddings`.
    ///
    /// The file is written next to its final location and renamed over it, so
    /// a reader sees either the previous mapping or the new one.
    pub fn store(&self, identity: &str, embeddings: &EmbeddingMap) -> Result<PathBuf, StorageError> {
        let dir = self.folder_dir(identity)?;
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut tensors = HashMap::with_capacity(embeddings.len());
        for (key, vector) in embeddings {
            let tensor = Tensor::from_slice(vector.as_slice(), vector.len(), &Device::Cpu)
                .map_err(|source| StorageError::Encode {
                    key: key.clone(),
                    source,
                })?;
            tensors.insert(key.clone(), tensor);
        }

        let path = dir.join(CACHE_FILE_NAME);
        let staging = dir.join(format!("{CACHE_FILE_NAME}.partial"));
        candle_core::safetensors::save(&tensors, &staging).map_err(|source| {
            StorageError::Encode {
                key: staging.display().to_string(),
                source,
            }
        })?;
        fs::rename(&staging, &path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(identity, entries = embeddings.len(), path = %path.display(), "stored embeddings");
        Ok(path)
    }
}

fn validate_identity(identity: &str) -> Result<(), StorageError> {
    let bad = identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains(['/', '\\']);
    if bad {
        return Err(StorageError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

fn tensor_to_vec(tensor: &Tensor) -> candle_core::Result<Vec<f32>> {
    tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}
