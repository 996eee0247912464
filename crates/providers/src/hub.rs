//! Resolves the files a pretrained model needs, downloading through the
//! Hugging Face hub cache when the model is not a local directory.

use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ProviderError;

const CONFIG_FILE: &str = "config.json";
const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    /// Missing for repositories that ship no processor config.
    pub preprocessor: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

/// Fetches config, processor config and weights for `model`.
///
/// `model` is either a hub repository id such as `facebook/dinov2-giant` or
/// a local directory laid out the same way.
pub fn fetch_model_files(model: &str, revision: &str) -> Result<ModelFiles, ProviderError> {
    let local = Path::new(model);
    if local.is_dir() {
        debug!(model, "loading model files from local directory");
        return LocalDir(local).resolve();
    }
    info!(model, revision, "fetching model files from the hub");
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        model.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    HubRepo(repo).resolve()
}

trait FileSource {
    fn get(&self, name: &str) -> Result<PathBuf, ProviderError>;

    fn resolve(&self) -> Result<ModelFiles, ProviderError> {
        let config = self.get(CONFIG_FILE)?;
        let preprocessor = self.get(PREPROCESSOR_FILE).ok();
        let weights = match self.get(WEIGHTS_FILE) {
            Ok(single) => vec![single],
            Err(_) => {
                let index_path = self.get(WEIGHTS_INDEX_FILE)?;
                shard_names(&index_path)?
                    .iter()
                    .map(|name| self.get(name))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(ModelFiles {
            config,
            preprocessor,
            weights,
        })
    }
}

struct HubRepo(ApiRepo);

impl FileSource for HubRepo {
    fn get(&self, name: &str) -> Result<PathBuf, ProviderError> {
        Ok(self.0.get(name)?)
    }
}

struct LocalDir<'a>(&'a Path);

impl FileSource for LocalDir<'_> {
    fn get(&self, name: &str) -> Result<PathBuf, ProviderError> {
        let path = self.0.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ProviderError::Io {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing model file"),
                path,
            })
        }
    }
}

/// Distinct shard file names listed by a safetensors index, in sorted order.
fn shard_names(index_path: &Path) -> Result<Vec<String>, ProviderError> {
    let raw = std::fs::read(index_path).map_err(|source| ProviderError::Io {
        path: index_path.to_path_buf(),
        source,
    })?;
    let index: WeightsIndex = serde_json::from_slice(&raw).map_err(|source| ProviderError::Json {
        path: index_path.to_path_buf(),
        source,
    })?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(ProviderError::Config(format!(
            "{} lists no weight shards",
            index_path.display()
        )));
    }
    Ok(shards.into_iter().collect())
}
