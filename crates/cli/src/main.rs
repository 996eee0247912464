use anyhow::{Context, Result};
use clap::Parser;
use diex::run::{self, ComputeOutput, RunSummary};
use diex::session::{self, Session};
use diex_core::config;
use diex_core::folder::FolderSpec;
use diex_core::visualize::Method;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(method) = cli.method {
        cfg.viz.method = method;
    }
    if let Some(port) = cli.port {
        cfg.viz.port = port;
    }
    let folders = cli
        .folders
        .iter()
        .map(|arg| FolderSpec::parse(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let stage_cfg = cfg.clone();
    let (ordinal, force) = (cli.device, cli.force);
    let output = tokio::task::spawn_blocking(move || -> Result<ComputeOutput> {
        let device = providers::select_device(ordinal);
        let loader = run::dinov2_loader(&stage_cfg.model, device);
        run::compute_stage(&stage_cfg, &folders, force, stage_cfg.viz.method, loader)
    })
    .await
    .context("compute stage panicked")??;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&RunSummary::new(&output))?);
    }
    if cli.no_serve {
        return Ok(());
    }

    let session = Session::new(output.dataset, output.results)?;
    session::serve(session::router(session), &cfg.viz.bind_address, cfg.viz.port).await
}

#[derive(Parser)]
#[command(name = "diex")]
#[command(about = "Explore DINOv2 embeddings of image folders", long_about = None)]
struct Cli {
    /// Image folders, as `path` or `label=path`
    #[arg(required = true, num_args = 1..)]
    folders: Vec<String>,

    /// Projection method: umap|tsne|pca
    #[arg(short = 'm', long, alias = "m")]
    method: Option<Method>,

    /// GPU ordinal
    #[arg(short = 'd', long, alias = "d", default_value_t = 0)]
    device: usize,

    /// Session port
    #[arg(short = 'p', long, alias = "p")]
    port: Option<u16>,

    /// Recompute and overwrite cached embeddings
    #[arg(long)]
    force: bool,

    /// Path to config file
    #[arg(short, long)]
    config: Option<String>,

    /// Stop after computing; do not start the session
    #[arg(long)]
    no_serve: bool,

    /// Print a JSON run summary
    #[arg(long)]
    json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_long_and_alias_flags() {
        let cli = Cli::parse_from(["diex", "--m", "tsne", "--d", "1", "--p", "6000", "a", "b=c"]);
        assert_eq!(cli.method, Some(Method::Tsne));
        assert_eq!(cli.device, 1);
        assert_eq!(cli.port, Some(6000));
        assert_eq!(cli.folders, vec!["a".to_string(), "b=c".to_string()]);

        let cli = Cli::parse_from(["diex", "-m", "pca", "--force", "--no-serve", "--json", "x"]);
        assert_eq!(cli.method, Some(Method::Pca));
        assert!(cli.force && cli.no_serve && cli.json);
        assert_eq!(cli.device, 0);
        assert_eq!(cli.port, None);
    }

    #[test]
    fn folders_are_required_and_methods_checked() {
        assert!(Cli::try_parse_from(["diex"]).is_err());
        assert!(Cli::try_parse_from(["diex", "--method", "mds", "x"]).is_err());
    }
}
