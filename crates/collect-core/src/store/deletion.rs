//! Guarded two-phase deletion of forms and instances.
//!
//! A form that any live instance still correlates to can never be removed.
//! Permitted deletions drop registry records first (one transaction) and
//! only then touch files; file failures are reported, never rolled back.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StorageLayout;
use crate::errors::CollectResult;
use crate::indexer::correlate::resolve_form_path;
use crate::models::{AssetKind, AssetRecord};
use crate::store::registry::{AssetRegistry, RegistryTx};

/// Result of the pre-deletion check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeletionVerdict {
    pub allowed: bool,
    pub blocking_form: Option<PathBuf>,
}

impl DeletionVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            blocking_form: None,
        }
    }
}

/// Human-readable reason a form could not be deleted.
pub fn blocked_message(form_path: &Path) -> String {
    let name = form_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| form_path.to_string_lossy().into_owned());
    format!(
        "{} cannot be deleted because it has data.",
        name.replace(".xml", " Form")
    )
}

/// Form paths referenced by the registry's instances, deduplicated, in
/// registry enumeration order. Unresolvable instances contribute nothing.
pub fn referenced_forms(tx: &RegistryTx<'_>, forms_dir: &Path) -> CollectResult<IndexSet<PathBuf>> {
    let instances = tx.list(AssetKind::Instance, None)?;
    Ok(instances
        .iter()
        .filter_map(|record| resolve_form_path(&record.path, forms_dir))
        .collect())
}

/// Refuse when any selected form still has instance data.
pub fn can_delete(
    tx: &RegistryTx<'_>,
    selected_form_paths: &HashSet<PathBuf>,
    forms_dir: &Path,
) -> CollectResult<DeletionVerdict> {
    if selected_form_paths.is_empty() {
        return Ok(DeletionVerdict::allowed());
    }
    let referenced = referenced_forms(tx, forms_dir)?;
    match referenced
        .into_iter()
        .find(|path| selected_form_paths.contains(path))
    {
        Some(blocking) => Ok(DeletionVerdict {
            allowed: false,
            blocking_form: Some(blocking),
        }),
        None => Ok(DeletionVerdict::allowed()),
    }
}

/// A file whose registry record was removed but which could not be deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub requested: usize,
    pub records_removed: Vec<PathBuf>,
    /// Selected paths the registry did not know about.
    pub unknown: Vec<PathBuf>,
    pub failed_files: Vec<FileFailure>,
}

impl DeleteReport {
    pub fn failed(&self) -> usize {
        self.unknown.len() + self.failed_files.len()
    }

    pub fn succeeded(&self) -> usize {
        self.requested.saturating_sub(self.failed())
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }

    /// `"k of n"` style summary of the deletion.
    pub fn summary(&self) -> String {
        if self.is_complete() {
            format!("{} deleted", self.succeeded())
        } else {
            format!(
                "{} of {} failed to delete",
                self.failed(),
                self.requested
            )
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Blocked { blocking_form: PathBuf, reason: String },
    Deleted(DeleteReport),
}

impl DeleteOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, DeleteOutcome::Blocked { .. })
    }

    pub fn report(&self) -> Option<&DeleteReport> {
        match self {
            DeleteOutcome::Deleted(report) => Some(report),
            DeleteOutcome::Blocked { .. } => None,
        }
    }
}

/// Delete the selected assets: guard, then records, then files.
///
/// The file phase runs after the record removal commits but before the
/// registry lock is released, so a concurrent reconciliation never sees a
/// file whose record is already gone.
pub fn delete_assets(
    registry: &AssetRegistry,
    selected_paths: &[PathBuf],
    layout: &StorageLayout,
) -> CollectResult<DeleteOutcome> {
    let mut selected: Vec<PathBuf> = Vec::with_capacity(selected_paths.len());
    for path in selected_paths {
        if !selected.contains(path) {
            selected.push(path.clone());
        }
    }
    let requested = selected.len();

    let outcome = registry.transaction_then(
        |tx| {
            let mut records: Vec<AssetRecord> = Vec::new();
            let mut unknown = Vec::new();
            for path in &selected {
                match tx.find_by_path(path)? {
                    Some(record) => records.push(record),
                    None => unknown.push(path.clone()),
                }
            }

            let selected_forms: HashSet<PathBuf> = records
                .iter()
                .filter(|r| r.is_form())
                .map(|r| r.path.clone())
                .collect();
            let verdict = can_delete(tx, &selected_forms, &layout.forms_dir)?;
            if let Some(blocking_form) = verdict.blocking_form {
                return Ok(Err(blocking_form));
            }

            for record in &records {
                tx.delete(record.id)?;
            }
            Ok(Ok((records, unknown)))
        },
        |phase_one| match phase_one {
            Ok((records, unknown)) => {
                DeleteOutcome::Deleted(remove_files(requested, records, unknown, layout))
            }
            Err(blocking_form) => {
                let reason = blocked_message(&blocking_form);
                DeleteOutcome::Blocked {
                    blocking_form,
                    reason,
                }
            }
        },
    )?;

    match &outcome {
        DeleteOutcome::Blocked { reason, .. } => info!("deletion blocked: {reason}"),
        DeleteOutcome::Deleted(report) => info!("delete request: {}", report.summary()),
    }
    Ok(outcome)
}

fn remove_files(
    requested: usize,
    records: Vec<AssetRecord>,
    unknown: Vec<PathBuf>,
    layout: &StorageLayout,
) -> DeleteReport {
    let mut report = DeleteReport {
        requested,
        records_removed: records.iter().map(|r| r.path.clone()).collect(),
        unknown,
        failed_files: Vec::new(),
    };
    for record in &records {
        if let Err(e) = remove_backing_files(record, layout) {
            warn!("could not delete {}: {e}", record.path.display());
            report.failed_files.push(FileFailure {
                path: record.path.clone(),
                error: e.to_string(),
            });
        }
    }
    report
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_backing_files(record: &AssetRecord, layout: &StorageLayout) -> std::io::Result<()> {
    match record.kind {
        AssetKind::Form => {
            remove_if_present(&record.path)?;
            if !record.content_hash.is_empty() {
                let cached = layout.formdef_cache_path(&record.content_hash);
                if let Err(e) = remove_if_present(&cached) {
                    debug!("left cached formdef {}: {e}", cached.display());
                }
            }
            Ok(())
        }
        AssetKind::Instance => {
            remove_if_present(&record.path)?;
            if let Some(dir) = record.path.parent() {
                let inside_root = dir != layout.instances_dir && dir.starts_with(&layout.instances_dir);
                if inside_root && dir.exists() {
                    std::fs::remove_dir_all(dir)?;
                }
            }
            Ok(())
        }
    }
}
