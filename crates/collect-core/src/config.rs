//! Runtime configuration: directory layout, registry location, and upload
//! endpoint settings.
//!
//! Values come from built-in defaults, then an optional JSON file, then
//! `COLLECT_*` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CollectError, CollectResult};
use crate::store::registry::resolve_path;

/// How the upload pipeline reacts when one item is not confirmed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the batch at the first failed item and report what succeeded.
    #[default]
    AbortBatch,
    /// Record the failed item and carry on with the rest of the batch.
    SkipItem,
}

impl std::str::FromStr for FailurePolicy {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" | "abort_batch" => Ok(FailurePolicy::AbortBatch),
            "skip" | "skip_item" => Ok(FailurePolicy::SkipItem),
            other => Err(CollectError::Config(format!(
                "unknown failure policy {other:?}"
            ))),
        }
    }
}

/// Where forms, instances, and cached form artifacts live on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    pub forms_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl StorageLayout {
    /// The conventional `forms/`, `instances/`, `.cache/` layout under `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            forms_dir: root.join("forms"),
            instances_dir: root.join("instances"),
            cache_dir: root.join(".cache"),
        }
    }

    /// Cached parse artifact for a form with the given content hash.
    pub fn formdef_cache_path(&self, content_hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{content_hash}.formdef"))
    }

    pub fn ensure_dirs(&self) -> CollectResult<()> {
        std::fs::create_dir_all(&self.forms_dir)?;
        std::fs::create_dir_all(&self.instances_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub forms_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub registry_path: PathBuf,
    pub submission_url: String,
    pub failure_policy: FailurePolicy,
    pub delete_after_upload: bool,
    pub hash_workers: usize,
    /// Extra headers attached to every submission request.
    pub common_headers: BTreeMap<String, String>,
}

const DEFAULT_ROOT: &str = "~/odk";

impl Default for CollectConfig {
    fn default() -> Self {
        Self::rooted_at(DEFAULT_ROOT)
    }
}

impl CollectConfig {
    /// Defaults with every directory placed under `root`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let layout = StorageLayout::under(root);
        Self {
            forms_dir: layout.forms_dir,
            instances_dir: layout.instances_dir,
            cache_dir: layout.cache_dir,
            registry_path: root.join("metadata").join("registry.db"),
            submission_url: String::new(),
            failure_policy: FailurePolicy::AbortBatch,
            delete_after_upload: true,
            hash_workers: 4,
            common_headers: BTreeMap::new(),
        }
    }

    /// Defaults, then `file` if given, then the process environment.
    pub fn load(file: Option<&Path>) -> CollectResult<Self> {
        let mut config = match file {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.resolve()
    }

    pub fn from_json_file(path: &Path) -> CollectResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Override fields from `COLLECT_*` variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> CollectResult<()> {
        if let Some(root) = lookup("COLLECT_ROOT") {
            let rooted = Self::rooted_at(root.trim());
            self.forms_dir = rooted.forms_dir;
            self.instances_dir = rooted.instances_dir;
            self.cache_dir = rooted.cache_dir;
            self.registry_path = rooted.registry_path;
        }
        if let Some(v) = lookup("COLLECT_FORMS_DIR") {
            self.forms_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("COLLECT_INSTANCES_DIR") {
            self.instances_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("COLLECT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("COLLECT_REGISTRY") {
            self.registry_path = PathBuf::from(v.trim());
        }
        if let Some(v) = lookup("COLLECT_SUBMISSION_URL") {
            self.submission_url = v.trim().to_string();
        }
        if let Some(v) = lookup("COLLECT_FAILURE_POLICY") {
            self.failure_policy = v.parse()?;
        }
        if let Some(v) = lookup("COLLECT_DELETE_AFTER_UPLOAD") {
            let v = v.trim().to_lowercase();
            self.delete_after_upload = !matches!(v.as_str(), "0" | "false" | "no" | "off");
        }
        if let Some(v) = lookup("COLLECT_HASH_WORKERS") {
            self.hash_workers = v.trim().parse().map_err(|_| {
                CollectError::Config(format!("COLLECT_HASH_WORKERS is not a number: {v:?}"))
            })?;
        }
        Ok(())
    }

    /// Expand `~`, anchor relative paths, and sanity-check values.
    pub fn resolve(mut self) -> CollectResult<Self> {
        self.forms_dir = resolve_path(&self.forms_dir)?;
        self.instances_dir = resolve_path(&self.instances_dir)?;
        self.cache_dir = resolve_path(&self.cache_dir)?;
        self.registry_path = resolve_path(&self.registry_path)?;
        self.hash_workers = self.hash_workers.max(1);
        if !self.submission_url.is_empty()
            && !(self.submission_url.starts_with("http://")
                || self.submission_url.starts_with("https://"))
        {
            return Err(CollectError::Config(format!(
                "submission_url must be an http(s) URL: {:?}",
                self.submission_url
            )));
        }
        Ok(self)
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout {
            forms_dir: self.forms_dir.clone(),
            instances_dir: self.instances_dir.clone(),
            cache_dir: self.cache_dir.clone(),
        }
    }
}
