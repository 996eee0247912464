//! Input folders: identity derivation and the per-folder file listing.

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::pipeline::PipelineError;

/// One input folder and the identity used for its cache entry and sample tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSpec {
    pub identity: String,
    pub path: PathBuf,
}

impl FolderSpec {
    pub fn new(identity: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            path: path.into(),
        }
    }

    /// Parses a command-line folder argument.
    ///
    /// `label=path` sets the identity explicitly; a bare path takes its last
    /// segment, so `data/cats` and `other/cats` share the identity `cats`.
    /// An existing directory is always a bare path, even if its name has `=`.
    pub fn parse(arg: &str) -> Result<Self, PipelineError> {
        if Path::new(arg).is_dir() {
            return Self::bare(arg);
        }
        if let Some((label, path)) = arg.split_once('=') {
            if is_label(label) && !path.is_empty() {
                return Ok(Self::new(label, path));
            }
        }
        Self::bare(arg)
    }

    fn bare(arg: &str) -> Result<Self, PipelineError> {
        let path = PathBuf::from(arg);
        let identity = last_segment(&path).ok_or_else(|| PipelineError::NoIdentity(arg.to_string()))?;
        Ok(Self::new(identity, path))
    }
}

fn is_label(label: &str) -> bool {
    !label.is_empty() && label != "." && label != ".." && !label.contains(['/', '\\'])
}

fn last_segment(path: &Path) -> Option<String> {
    if let Some(name) = path.file_name() {
        return Some(name.to_string_lossy().into_owned());
    }
    // `.`, `..` and friends name no segment themselves.
    let resolved = std::fs::canonicalize(path).ok()?;
    resolved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

pub fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid exclude pattern {pat:?}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Direct file entries of `folder`, sorted by file name.
///
/// Subdirectories are skipped, as are names matching `excludes`.
pub fn list_files(folder: &Path, excludes: &GlobSet) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to list {}", folder.display()))?;
        if entry.file_type().is_dir() || is_excluded(entry.file_name(), excludes) {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

fn is_excluded(name: &std::ffi::OsStr, excludes: &GlobSet) -> bool {
    excludes.is_match(Path::new(name))
}

/// Cache key of a listed file: its file name.
pub fn file_key(path: &Path) -> Result<String, PipelineError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PipelineError::NoIdentity(path.display().to_string()))
}
