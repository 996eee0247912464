use diex::run::{self, RunSummary};
use diex_core::config::AppConfig;
use diex_core::folder::FolderSpec;
use diex_core::pipeline::{self, AssembleOptions, EmbeddingSource, PipelineError};
use diex_core::visualize::Method;
use image::{Rgb, RgbImage};
use providers::{ImageEmbedder, ProviderError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use storage::{EmbeddingCache, EmbeddingMap};
use tempfile::tempdir;

/// Embeds an image as its first pixel plus its width, counting calls.
struct FakeEmbedder {
    calls: Arc<AtomicUsize>,
}

impl ImageEmbedder for FakeEmbedder {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let img = image::open(path)
            .map_err(|source| ProviderError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let px = img.get_pixel(0, 0);
        Ok(vec![px[0] as f32, px[1] as f32, px[2] as f32, img.width() as f32])
    }
}

#[derive(Default)]
struct Counters {
    loads: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl Counters {
    fn loader(&self) -> impl FnMut() -> anyhow::Result<Box<dyn ImageEmbedder>> {
        let loads = self.loads.clone();
        let calls = self.calls.clone();
        move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEmbedder { calls: calls.clone() }) as Box<dyn ImageEmbedder>)
        }
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn write_image(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    RgbImage::from_pixel(8, 8, Rgb(color)).save(&path).unwrap();
    path
}

fn cats(root: &Path) -> PathBuf {
    let dir = root.join("data").join("cats");
    write_image(&dir, "a.png", [10, 0, 0]);
    write_image(&dir, "b.png", [20, 0, 0]);
    write_image(&dir, "c.png", [30, 0, 0]);
    dir
}

fn config_with_cache(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.cache.root = Some(root.to_string_lossy().into_owned());
    cfg
}

#[test]
fn first_run_computes_and_persists_cats() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    let cache_root = temp.path().join("cache");
    let cfg = config_with_cache(&cache_root);
    let counters = Counters::default();
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];

    let output = run::compute_stage(&cfg, &folders, false, Method::Umap, counters.loader()).unwrap();

    assert!(cache_root.join("cats").join("embeddings.safetensors").is_file());
    assert_eq!(counters.loads(), 1);
    assert_eq!(counters.calls(), 3);
    assert_eq!(output.model_calls, 3);
    assert_eq!(output.dataset.len(), 3);
    assert!(output.dataset.samples().iter().all(|s| s.tags == vec!["cats".to_string()]));
    assert_eq!(output.results.points.len(), 3);
    assert_eq!(output.results.brain_key, "img_viz");
    assert_eq!(output.reports[0].source, EmbeddingSource::Computed);

    let stored = EmbeddingCache::new(&cache_root).fetch("cats").unwrap().unwrap();
    let mut keys: Vec<_> = stored.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["a.png", "b.png", "c.png"]);
    assert_eq!(stored["b.png"], vec![20.0, 0.0, 0.0, 8.0]);
}

#[test]
fn rerun_uses_cache_without_loading_the_model() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];
    let options = AssembleOptions::default();

    let first = pipeline::assemble(&folders, &cache, &options, Counters::default().loader()).unwrap();

    let counters = Counters::default();
    let second = pipeline::assemble(&folders, &cache, &options, counters.loader()).unwrap();
    assert_eq!(counters.loads(), 0);
    assert_eq!(counters.calls(), 0);
    assert_eq!(second.model_calls, 0);
    assert_eq!(second.reports[0].source, EmbeddingSource::Cached);
    assert_eq!(first.embeddings, second.embeddings);
    assert_eq!(first.dataset.samples(), second.dataset.samples());
}

#[test]
fn force_recomputes_and_overwrites() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let mut bogus = EmbeddingMap::new();
    for name in ["a.png", "b.png", "c.png", "gone.png"] {
        bogus.insert(name.to_string(), vec![-1.0; 4]);
    }
    cache.store("cats", &bogus).unwrap();

    let counters = Counters::default();
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];
    let options = AssembleOptions {
        force: true,
        ..Default::default()
    };
    let assembled = pipeline::assemble(&folders, &cache, &options, counters.loader()).unwrap();

    assert_eq!(counters.calls(), 3);
    assert_eq!(assembled.reports[0].source, EmbeddingSource::Computed);
    let stored = cache.fetch("cats").unwrap().unwrap();
    assert_eq!(stored.len(), 3);
    assert!(!stored.contains_key("gone.png"));
    assert_eq!(stored["a.png"], vec![10.0, 0.0, 0.0, 8.0]);
}

#[test]
fn new_file_in_cached_folder_is_fatal() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];
    let options = AssembleOptions::default();
    pipeline::assemble(&folders, &cache, &options, Counters::default().loader()).unwrap();

    write_image(&dir, "d.png", [40, 0, 0]);
    let counters = Counters::default();
    let err = pipeline::assemble(&folders, &cache, &options, counters.loader()).unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::MissingCachedEmbedding { identity, file }) => {
            assert_eq!(identity, "cats");
            assert_eq!(file, "d.png");
        }
        other => panic!("unexpected error: {other:?} ({err:#})"),
    }
    assert_eq!(counters.calls(), 0);
}

#[test]
fn model_loads_once_across_missing_folders() {
    let temp = tempdir().unwrap();
    let cats_dir = cats(temp.path());
    let dogs_dir = temp.path().join("data").join("dogs");
    write_image(&dogs_dir, "x.png", [0, 50, 0]);
    write_image(&dogs_dir, "y.png", [0, 60, 0]);
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let folders = vec![
        FolderSpec::parse(cats_dir.to_str().unwrap()).unwrap(),
        FolderSpec::parse(dogs_dir.to_str().unwrap()).unwrap(),
    ];

    let counters = Counters::default();
    let assembled = pipeline::assemble(&folders, &cache, &AssembleOptions::default(), counters.loader()).unwrap();
    assert_eq!(counters.loads(), 1);
    assert_eq!(counters.calls(), 5);
    let tags: Vec<&str> = assembled.dataset.samples().iter().map(|s| s.tags[0].as_str()).collect();
    assert_eq!(tags, vec!["cats", "cats", "cats", "dogs", "dogs"]);
    assert!(cache.fetch("dogs").unwrap().is_some());
}

#[test]
fn rows_follow_sample_order() {
    let temp = tempdir().unwrap();
    let cats_dir = cats(temp.path());
    let dogs_dir = temp.path().join("data").join("dogs");
    write_image(&dogs_dir, "x.png", [0, 50, 0]);
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let folders = vec![
        FolderSpec::parse(&format!("pets={}", dogs_dir.display())).unwrap(),
        FolderSpec::parse(cats_dir.to_str().unwrap()).unwrap(),
    ];
    let options = AssembleOptions::default();
    // Warm only the cats cache so the run mixes a hit with a miss.
    pipeline::assemble(&folders[1..], &cache, &options, Counters::default().loader()).unwrap();

    let counters = Counters::default();
    let assembled = pipeline::assemble(&folders, &cache, &options, counters.loader()).unwrap();
    assert_eq!(counters.calls(), 1);
    assert_eq!(assembled.embeddings.rows(), assembled.dataset.len());

    let fake = FakeEmbedder {
        calls: Arc::new(AtomicUsize::new(0)),
    };
    for (i, sample) in assembled.dataset.samples().iter().enumerate() {
        assert_eq!(sample.id, i);
        let expected = fake.embed(&sample.filepath).unwrap();
        assert_eq!(assembled.embeddings.row(i), Some(expected.as_slice()));
    }
    assert_eq!(assembled.dataset.get(0).unwrap().tags, vec!["pets".to_string()]);
}

#[test]
fn folders_with_the_same_name_share_a_cache_entry() {
    let temp = tempdir().unwrap();
    let first = temp.path().join("data").join("cats");
    let second = temp.path().join("other").join("cats");
    write_image(&first, "a.png", [1, 0, 0]);
    write_image(&second, "a.png", [99, 0, 0]);
    let cache_root = temp.path().join("cache");
    let cache = EmbeddingCache::new(&cache_root);
    let folders = vec![
        FolderSpec::parse(first.to_str().unwrap()).unwrap(),
        FolderSpec::parse(second.to_str().unwrap()).unwrap(),
    ];

    let counters = Counters::default();
    let assembled = pipeline::assemble(&folders, &cache, &AssembleOptions::default(), counters.loader()).unwrap();

    assert_eq!(counters.calls(), 1);
    assert_eq!(assembled.reports[1].source, EmbeddingSource::Cached);
    assert_eq!(assembled.reports[0].cache_file, assembled.reports[1].cache_file);
    assert_eq!(assembled.embeddings.row(0), assembled.embeddings.row(1));
    assert_eq!(fs::read_dir(&cache_root).unwrap().count(), 1);
}

#[test]
fn excluded_files_are_not_embedded() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    fs::write(dir.join("notes.txt"), "not an image").unwrap();
    fs::create_dir_all(dir.join("nested")).unwrap();
    let mut cfg = config_with_cache(&temp.path().join("cache"));
    cfg.scan.exclude = vec!["*.txt".to_string()];
    let counters = Counters::default();
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];

    let output = run::compute_stage(&cfg, &folders, false, Method::Pca, counters.loader()).unwrap();
    assert_eq!(output.dataset.len(), 3);
    assert_eq!(counters.calls(), 3);
}

#[test]
fn undecodable_file_fails_the_run() {
    let temp = tempdir().unwrap();
    let dir = cats(temp.path());
    fs::write(dir.join("broken.png"), "not an image").unwrap();
    let cache = EmbeddingCache::new(temp.path().join("cache"));
    let folders = vec![FolderSpec::parse(dir.to_str().unwrap()).unwrap()];

    let err = pipeline::assemble(&folders, &cache, &AssembleOptions::default(), Counters::default().loader())
        .unwrap_err();
    assert!(format!("{err:#}").contains("broken.png"));
    assert!(cache.fetch("cats").unwrap().is_none());
}

#[test]
fn summary_counts_computed_and_reused() {
    let temp = tempdir().unwrap();
    let cats_dir = cats(temp.path());
    let dogs_dir = temp.path().join("data").join("dogs");
    write_image(&dogs_dir, "x.png", [0, 50, 0]);
    let cfg = config_with_cache(&temp.path().join("cache"));
    let cats_only = vec![FolderSpec::parse(cats_dir.to_str().unwrap()).unwrap()];
    run::compute_stage(&cfg, &cats_only, false, Method::Pca, Counters::default().loader()).unwrap();

    let folders = vec![
        FolderSpec::parse(cats_dir.to_str().unwrap()).unwrap(),
        FolderSpec::parse(dogs_dir.to_str().unwrap()).unwrap(),
    ];
    let output = run::compute_stage(&cfg, &folders, false, Method::Tsne, Counters::default().loader()).unwrap();
    let summary = serde_json::to_value(RunSummary::new(&output)).unwrap();

    assert_eq!(summary["samples"], 4);
    assert_eq!(summary["computed"], 1);
    assert_eq!(summary["reused"], 3);
    assert_eq!(summary["model_calls"], 1);
    assert_eq!(summary["dim"], 4);
    assert_eq!(summary["method"], "tsne");
    assert_eq!(summary["folders"][0]["source"], "cached");
    assert_eq!(summary["folders"][1]["identity"], "dogs");
}
