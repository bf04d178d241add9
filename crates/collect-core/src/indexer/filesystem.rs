//! Filesystem scanning helpers for reconciliation passes.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::CollectResult;
use crate::indexer::correlate::FORM_EXTENSIONS;

/// Whether `path` names a form definition (`.xml` / `.xhtml`).
pub fn is_form_file(path: &Path) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = ext.to_string_lossy().to_lowercase();
    FORM_EXTENSIONS.iter().any(|e| *e == ext.as_str())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Form definition files directly inside `forms_dir`, sorted by path.
///
/// A missing directory yields an empty list; unreadable entries are skipped.
pub fn iter_form_files(forms_dir: &Path) -> Vec<PathBuf> {
    if !forms_dir.is_dir() {
        return vec![];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(forms_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("skipping unreadable forms entry: {e}");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !is_hidden(p) && is_form_file(p))
        .collect();
    files.sort();
    files
}

/// SHA-256 hex digest of a file's bytes.
pub fn compute_content_hash(path: &Path) -> CollectResult<String> {
    let mut hasher = Sha256::new();
    let data = std::fs::read(path)?;
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash `paths` on a rayon pool of `workers` threads, preserving input order.
/// Files that cannot be read get an empty hash.
pub fn hash_files(paths: &[PathBuf], workers: usize) -> Vec<(PathBuf, String)> {
    if paths.is_empty() {
        return vec![];
    }

    let hash_one = |path: &PathBuf| {
        let hash = compute_content_hash(path).unwrap_or_else(|e| {
            warn!("could not hash {}: {e}", path.display());
            String::new()
        });
        (path.clone(), hash)
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    match pool {
        Ok(pool) => pool.install(|| paths.par_iter().map(hash_one).collect()),
        Err(_) => {
            // Fallback to sequential
            paths.iter().map(hash_one).collect()
        }
    }
}
