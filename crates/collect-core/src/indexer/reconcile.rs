//! Registry/filesystem reconciliation.
//!
//! One pass adds FORM records for untracked definition files, then drops
//! FORM and INSTANCE records whose backing files are gone. The pass is a
//! single registry transaction and is idempotent.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::StorageLayout;
use crate::errors::CollectResult;
use crate::indexer::filesystem::{hash_files, iter_form_files};
use crate::models::AssetKind;
use crate::store::registry::AssetRegistry;

/// What one reconciliation pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub forms_added: Vec<PathBuf>,
    pub forms_removed: Vec<PathBuf>,
    pub instances_removed: Vec<PathBuf>,
}

impl ReconcileReport {
    pub fn changes(&self) -> usize {
        self.forms_added.len() + self.forms_removed.len() + self.instances_removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes() == 0
    }
}

/// An instance is backed while both its directory and manifest exist.
fn instance_is_backed(manifest: &Path) -> bool {
    let dir_ok = manifest.parent().map(Path::is_dir).unwrap_or(false);
    dir_ok && manifest.is_file()
}

/// Align the registry with the forms and instances on disk.
pub fn reconcile(
    registry: &AssetRegistry,
    layout: &StorageLayout,
    hash_workers: usize,
) -> CollectResult<ReconcileReport> {
    let on_disk = iter_form_files(&layout.forms_dir);

    let report = registry.transaction(|tx| {
        let mut report = ReconcileReport::default();

        // 1. add missing forms
        let mut untracked = Vec::new();
        for path in &on_disk {
            if tx.find_by_path(path)?.is_none() {
                untracked.push(path.clone());
            }
        }
        for (path, hash) in hash_files(&untracked, hash_workers) {
            if tx.upsert_form(&path, &hash)? {
                debug!("tracking form {}", path.display());
                report.forms_added.push(path);
            }
        }

        // 2. remove orphaned forms
        for record in tx.list(AssetKind::Form, None)?.iter() {
            if !record.path.is_file() && tx.delete(record.id)? {
                report.forms_removed.push(record.path.clone());
            }
        }

        // 3. remove orphaned instances
        for record in tx.list(AssetKind::Instance, None)?.iter() {
            if !instance_is_backed(&record.path) && tx.delete(record.id)? {
                report.instances_removed.push(record.path.clone());
            }
        }

        Ok(report)
    })?;

    if !report.is_empty() {
        info!(
            "reconciled registry: +{} forms, -{} forms, -{} instances",
            report.forms_added.len(),
            report.forms_removed.len(),
            report.instances_removed.len()
        );
    }
    Ok(report)
}
