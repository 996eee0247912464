use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::visualize::Method;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub model: ModelConfig,
    pub scan: ScanConfig,
    pub viz: VizConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; `~/` is expanded. Defaults to `$HOME/.cache/diex`.
    pub root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hub repository id or local directory.
    pub repo: String,
    pub revision: String,
    /// f32 | f16 | bf16
    pub dtype: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// File-name globs skipped when listing a folder.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VizConfig {
    pub method: Method,
    pub bind_address: String,
    pub port: u16,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: "facebook/dinov2-giant".to_string(),
            revision: "main".to_string(),
            dtype: "f32".to_string(),
        }
    }
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            method: Method::Umap,
            bind_address: "127.0.0.1".to_string(),
            port: 5151,
            seed: 51,
        }
    }
}

impl CacheConfig {
    pub fn resolved_root(&self) -> PathBuf {
        let home = dirs::home_dir();
        match (&self.root, home) {
            (Some(root), Some(home)) if root == "~" => home,
            (Some(root), Some(home)) if root.starts_with("~/") => home.join(&root[2..]),
            (Some(root), _) => PathBuf::from(root),
            (None, Some(home)) => home.join(".cache").join("diex"),
            (None, None) => PathBuf::from(".cache").join("diex"),
        }
    }
}

/// Builds the config from defaults, an optional file and `DIEX_*` variables.
///
/// Without an explicit path, `config/default.{toml,yaml,json}` is read if present.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("DIEX")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("scan.exclude"),
    );
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}
