//! Shared typed models used across the registry, reconciler, and upload layers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CollectError;

// ---------------------------------------------------------------------------
// AssetKind
// ---------------------------------------------------------------------------

/// What a tracked file is: a form definition or a collected-data instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Form,
    Instance,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Form => "form",
            AssetKind::Instance => "instance",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(AssetKind::Form),
            "instance" => Ok(AssetKind::Instance),
            other => Err(CollectError::Database(format!("unknown asset kind {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// AssetStatus
// ---------------------------------------------------------------------------

/// Lifecycle status. Forms stay `Available`; instances advance
/// `Available -> Incomplete -> Complete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Available,
    Incomplete,
    Complete,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Available => "available",
            AssetStatus::Incomplete => "incomplete",
            AssetStatus::Complete => "complete",
        }
    }

    /// Whether an instance may move from `self` to `next`. Staying put is
    /// allowed so repeated saves are harmless.
    pub fn can_advance_to(&self, next: AssetStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(AssetStatus::Available),
            "incomplete" => Ok(AssetStatus::Incomplete),
            "complete" => Ok(AssetStatus::Complete),
            other => Err(CollectError::Database(format!(
                "unknown asset status {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AssetRecord
// ---------------------------------------------------------------------------

/// A registry row describing one tracked file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub id: i64,
    pub path: PathBuf,
    pub display_name: String,
    pub meta_text: String,
    pub kind: AssetKind,
    pub status: AssetStatus,
    pub content_hash: String,
    pub updated_at: Option<String>,
}

impl AssetRecord {
    pub fn is_form(&self) -> bool {
        self.kind == AssetKind::Form
    }

    pub fn is_instance(&self) -> bool {
        self.kind == AssetKind::Instance
    }
}

/// Insert payload for a new registry row. Labels are derived from the path
/// and the kind/status pair.
#[derive(Clone, Debug)]
pub struct NewAsset {
    pub path: PathBuf,
    pub kind: AssetKind,
    pub status: AssetStatus,
    pub content_hash: String,
}

impl NewAsset {
    pub fn form(path: impl Into<PathBuf>, content_hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: AssetKind::Form,
            status: AssetStatus::Available,
            content_hash: content_hash.into(),
        }
    }

    pub fn instance(
        path: impl Into<PathBuf>,
        status: AssetStatus,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind: AssetKind::Instance,
            status,
            content_hash: content_hash.into(),
        }
    }

    pub fn display_name(&self) -> String {
        display_name_for(&self.path)
    }

    pub fn meta_text(&self) -> String {
        meta_text_for(self.kind, self.status)
    }
}

/// File stem of `path`, falling back to the full file name.
pub fn display_name_for(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn meta_text_for(kind: AssetKind, status: AssetStatus) -> String {
    match (kind, status) {
        (AssetKind::Form, _) => "Form definition".to_string(),
        (AssetKind::Instance, AssetStatus::Available) => "New instance".to_string(),
        (AssetKind::Instance, AssetStatus::Incomplete) => "Incomplete instance".to_string(),
        (AssetKind::Instance, AssetStatus::Complete) => "Complete instance".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Records materialised at query time. Iterating never touches the store, and
/// a snapshot can be walked any number of times.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: Vec<AssetRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<AssetRecord>) -> Self {
        Self { records }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AssetRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn into_vec(self) -> Vec<AssetRecord> {
        self.records
    }
}

impl IntoIterator for Snapshot {
    type Item = AssetRecord;
    type IntoIter = std::vec::IntoIter<AssetRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a AssetRecord;
    type IntoIter = std::slice::Iter<'a, AssetRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Per-kind/status totals, recomputed by the registry on demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AssetCounts {
    pub forms: i64,
    pub instances_incomplete: i64,
    pub instances_complete: i64,
    pub instances_total: i64,
}
