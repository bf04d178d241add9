//! Caller-facing facade over the registry, reconciler, deletion guard and
//! upload pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{CollectConfig, StorageLayout};
use crate::errors::{CollectError, CollectResult};
use crate::indexer::filesystem::compute_content_hash;
use crate::indexer::reconcile::{reconcile, ReconcileReport};
use crate::models::{AssetCounts, AssetKind, AssetRecord, AssetStatus, NewAsset, Snapshot};
use crate::store::deletion::{delete_assets, DeleteOutcome, DeleteReport};
use crate::store::registry::AssetRegistry;
use crate::upload::descriptor::InstanceDescriptor;
use crate::upload::pipeline::{BatchReport, RegistrationQueue, UploadListener, UploadPipeline};
use crate::upload::transport::{HttpTransport, SubmissionTransport};

pub struct Collector {
    config: CollectConfig,
    layout: StorageLayout,
    registry: Arc<AssetRegistry>,
    pipeline: Arc<UploadPipeline>,
}

impl Collector {
    /// Open the registry and storage directories described by `config`,
    /// submitting over HTTP.
    pub fn open(config: CollectConfig) -> CollectResult<Self> {
        let transport = Arc::new(HttpTransport::new(config.common_headers.clone())?);
        Self::with_transport(config, transport, None)
    }

    pub fn with_transport(
        config: CollectConfig,
        transport: Arc<dyn SubmissionTransport>,
        registrations: Option<Arc<dyn RegistrationQueue>>,
    ) -> CollectResult<Self> {
        let layout = config.layout();
        layout.ensure_dirs()?;
        let registry = Arc::new(AssetRegistry::open(&config.registry_path)?);

        let mut pipeline = UploadPipeline::new(
            config.submission_url.clone(),
            config.failure_policy,
            transport,
        );
        if let Some(queue) = registrations {
            pipeline = pipeline.with_registrations(queue);
        }

        Ok(Self {
            config,
            layout,
            registry,
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<UploadPipeline> {
        &self.pipeline
    }

    /// Bring the registry in line with the filesystem.
    pub fn refresh(&self) -> CollectResult<ReconcileReport> {
        reconcile(&self.registry, &self.layout, self.config.hash_workers)
    }

    pub fn list_forms(&self) -> CollectResult<Snapshot> {
        self.refresh()?;
        self.registry.list(AssetKind::Form, None)
    }

    /// Instances, optionally only those in `status`.
    pub fn list_instances(&self, status: Option<AssetStatus>) -> CollectResult<Snapshot> {
        self.refresh()?;
        self.registry.list(AssetKind::Instance, status)
    }

    pub fn list_all(&self) -> CollectResult<Snapshot> {
        self.refresh()?;
        self.registry.list_all()
    }

    pub fn counts(&self) -> CollectResult<AssetCounts> {
        self.refresh()?;
        self.registry.counts()
    }

    /// Track a saved instance manifest. Registering a known path moves it
    /// forward to `status` instead.
    pub fn register_instance(
        &self,
        manifest: &Path,
        status: AssetStatus,
    ) -> CollectResult<AssetRecord> {
        if let Some(existing) = self.registry.find_by_path(manifest)? {
            if existing.status == status {
                return Ok(existing);
            }
            return self.registry.advance_status(existing.id, status);
        }
        let hash = compute_content_hash(manifest)?;
        let record = self
            .registry
            .insert(&NewAsset::instance(manifest, status, hash))?;
        debug!("registered instance {}", manifest.display());
        Ok(record)
    }

    pub fn advance_status(&self, id: i64, status: AssetStatus) -> CollectResult<AssetRecord> {
        self.registry.advance_status(id, status)
    }

    pub fn request_delete(&self, paths: &[PathBuf]) -> CollectResult<DeleteOutcome> {
        delete_assets(&self.registry, paths, &self.layout)
    }

    /// Start a background upload of `descriptors`. `listener` replaces any
    /// listener already registered on the pipeline.
    ///
    /// When `delete_after_upload` is set, confirmed instances are removed
    /// once the batch finishes. A failed removal is logged and the batch
    /// report is still returned.
    pub fn enqueue_upload(
        &self,
        descriptors: Vec<InstanceDescriptor>,
        listener: Option<Arc<dyn UploadListener>>,
    ) -> CollectResult<JoinHandle<CollectResult<BatchReport>>> {
        if self.config.submission_url.is_empty() {
            return Err(CollectError::Config(
                "no submission_url configured".to_string(),
            ));
        }
        self.pipeline.set_listener(listener);
        let batch = self.pipeline.spawn(descriptors)?;

        let registry = Arc::clone(&self.registry);
        let layout = self.layout.clone();
        let delete_after_upload = self.config.delete_after_upload;
        Ok(tokio::spawn(async move {
            let report = batch
                .await
                .map_err(|e| CollectError::Runtime(e.to_string()))?;
            if !delete_after_upload || report.uploaded.is_empty() {
                return Ok(report);
            }
            let uploaded = report.uploaded.clone();
            let cleanup = tokio::task::spawn_blocking(move || {
                remove_uploaded(&registry, &layout, &uploaded)
            })
            .await
            .map_err(|e| CollectError::Runtime(e.to_string()))
            .and_then(|removed| removed);
            Ok(settle_upload(report, cleanup))
        }))
    }

    /// Drop the records and directories of uploaded instances, if the
    /// configuration asks for it.
    pub fn finish_upload(&self, uploaded: &[PathBuf]) -> CollectResult<DeleteReport> {
        if !self.config.delete_after_upload {
            return Ok(DeleteReport::default());
        }
        remove_uploaded(&self.registry, &self.layout, uploaded)
    }
}

fn settle_upload(report: BatchReport, cleanup: CollectResult<DeleteReport>) -> BatchReport {
    match cleanup {
        Ok(removed) => debug!(
            "removed {} of {} uploaded instances",
            removed.records_removed.len(),
            report.uploaded.len()
        ),
        Err(e) => warn!(
            "uploaded {} instances but could not remove them: {e}",
            report.uploaded.len()
        ),
    }
    report
}

fn remove_uploaded(
    registry: &AssetRegistry,
    layout: &StorageLayout,
    uploaded: &[PathBuf],
) -> CollectResult<DeleteReport> {
    let mut instances = Vec::with_capacity(uploaded.len());
    for path in uploaded {
        match registry.find_by_path(path)? {
            Some(record) if record.is_form() => {
                warn!("not removing form {} after upload", path.display());
            }
            _ => instances.push(path.clone()),
        }
    }
    // Instances never gate deletion, so this cannot come back blocked.
    let outcome = delete_assets(registry, &instances, layout)?;
    Ok(outcome.report().cloned().unwrap_or_default())
}
