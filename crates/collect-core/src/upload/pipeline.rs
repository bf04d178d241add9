//! Sequential batch uploader.
//!
//! A batch walks its descriptors in order, building one multipart payload
//! per instance and handing it to a [`SubmissionTransport`]. Progress and
//! completion go to whichever [`UploadListener`] is registered at the moment
//! of delivery, so callers may swap listeners while a batch is running.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FailurePolicy;
use crate::errors::{CollectError, CollectResult};
use crate::upload::descriptor::InstanceDescriptor;
use crate::upload::payload::build_payload;
use crate::upload::transport::SubmissionTransport;

pub trait UploadListener: Send + Sync {
    /// `current` is 1-based and strictly increasing within a batch.
    fn progress_update(&self, current: usize, total: usize);
    fn uploading_complete(&self, uploaded: &[PathBuf]);
}

/// Out-of-band records that must reach the server before a batch.
#[async_trait]
pub trait RegistrationQueue: Send + Sync {
    /// Push pending records to `base_url`; returns how many were sent.
    async fn flush_pending(&self, base_url: &str) -> CollectResult<usize>;
}

/// Endpoint base used for registration flushes.
pub fn registration_base_url(endpoint: &str) -> String {
    endpoint.replace("/submission", "")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Aborted | BatchState::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Instance directory could not be read. Always stops the batch.
    Listing,
    /// Network or I/O error before a response arrived.
    Transport,
    /// Server answered but did not confirm storage.
    Rejected {
        status: u16,
        location: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// 0-based position in the batch.
    pub index: usize,
    pub instance_path: PathBuf,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub state: BatchState,
    pub total: usize,
    pub attempted: usize,
    pub uploaded: Vec<PathBuf>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    fn start(total: usize) -> Self {
        Self {
            state: BatchState::Running,
            total,
            attempted: 0,
            uploaded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Claim on the pipeline's single batch slot, taken by `begin`.
///
/// If the batch future is dropped or unwinds before `settle`, the state
/// falls back to `Cancelled` (cancel was requested) or `Aborted`, so the
/// pipeline accepts the next batch.
pub(crate) struct BatchGuard {
    state: Arc<Mutex<BatchState>>,
    token: CancellationToken,
    settled: bool,
}

impl BatchGuard {
    fn settle(mut self, state: BatchState) {
        *self.state.lock() = state;
        self.settled = true;
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let fallback = if self.token.is_cancelled() {
            BatchState::Cancelled
        } else {
            BatchState::Aborted
        };
        warn!("upload batch ended without finishing, marking it {fallback:?}");
        *self.state.lock() = fallback;
    }
}

pub struct UploadPipeline {
    endpoint: String,
    policy: FailurePolicy,
    transport: Arc<dyn SubmissionTransport>,
    registrations: Option<Arc<dyn RegistrationQueue>>,
    listener: Mutex<Option<Arc<dyn UploadListener>>>,
    state: Arc<Mutex<BatchState>>,
    cancel: Mutex<CancellationToken>,
}

impl UploadPipeline {
    pub fn new(
        endpoint: impl Into<String>,
        policy: FailurePolicy,
        transport: Arc<dyn SubmissionTransport>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy,
            transport,
            registrations: None,
            listener: Mutex::new(None),
            state: Arc::new(Mutex::new(BatchState::Idle)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_registrations(mut self, queue: Arc<dyn RegistrationQueue>) -> Self {
        self.registrations = Some(queue);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn state(&self) -> BatchState {
        *self.state.lock()
    }

    /// Replace (or clear) the listener. Takes effect at the next delivery.
    pub fn set_listener(&self, listener: Option<Arc<dyn UploadListener>>) {
        *self.listener.lock() = listener;
    }

    /// Ask the running batch to stop after the item in flight.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Upload `descriptors` on the current task.
    pub async fn run(&self, descriptors: Vec<InstanceDescriptor>) -> CollectResult<BatchReport> {
        let guard = self.begin()?;
        Ok(self.execute(descriptors, guard).await)
    }

    /// Upload `descriptors` on a background tokio task.
    ///
    /// The busy check happens before spawning, so a second call while a batch
    /// is running fails immediately with [`CollectError::PipelineBusy`].
    pub fn spawn(
        self: &Arc<Self>,
        descriptors: Vec<InstanceDescriptor>,
    ) -> CollectResult<JoinHandle<BatchReport>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CollectError::Runtime(e.to_string()))?;
        let guard = self.begin()?;
        let pipeline = Arc::clone(self);
        Ok(runtime.spawn(async move { pipeline.execute(descriptors, guard).await }))
    }

    pub(crate) fn begin(&self) -> CollectResult<BatchGuard> {
        let mut state = self.state.lock();
        if *state == BatchState::Running {
            return Err(CollectError::PipelineBusy);
        }
        *state = BatchState::Running;
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        Ok(BatchGuard {
            state: Arc::clone(&self.state),
            token,
            settled: false,
        })
    }

    async fn execute(
        &self,
        descriptors: Vec<InstanceDescriptor>,
        guard: BatchGuard,
    ) -> BatchReport {
        let token = guard.token.clone();
        let total = descriptors.len();
        self.flush_registrations().await;

        let mut report = BatchReport::start(total);
        for (index, descriptor) in descriptors.iter().enumerate() {
            if token.is_cancelled() {
                info!("upload batch cancelled after {index} of {total}");
                report.state = BatchState::Cancelled;
                break;
            }
            self.deliver_progress(index + 1, total);
            report.attempted += 1;

            match self.upload_one(index, descriptor).await {
                Ok(()) => report.uploaded.push(descriptor.instance_path.clone()),
                Err(failure) => {
                    warn!(
                        "upload of {} failed: {}",
                        failure.instance_path.display(),
                        failure.reason
                    );
                    let hard = failure.kind == FailureKind::Listing;
                    report.failures.push(failure);
                    if hard || self.policy == FailurePolicy::AbortBatch {
                        report.state = BatchState::Aborted;
                        break;
                    }
                }
            }
        }
        if report.state == BatchState::Running {
            report.state = BatchState::Completed;
        }

        info!(
            "upload batch {:?}: {} of {} uploaded",
            report.state,
            report.uploaded.len(),
            total
        );
        guard.settle(report.state);
        self.deliver_complete(&report.uploaded);
        report
    }

    async fn flush_registrations(&self) {
        let Some(queue) = &self.registrations else {
            return;
        };
        let base = registration_base_url(&self.endpoint);
        match queue.flush_pending(&base).await {
            Ok(sent) => debug!("flushed {sent} pending registrations to {base}"),
            Err(e) => warn!("registration flush to {base} failed: {e}"),
        }
    }

    async fn upload_one(
        &self,
        index: usize,
        descriptor: &InstanceDescriptor,
    ) -> Result<(), ItemFailure> {
        let failure = |kind, reason: String| ItemFailure {
            index,
            instance_path: descriptor.instance_path.clone(),
            kind,
            reason,
        };

        let payload = build_payload(&descriptor.instance_path)
            .map_err(|e| failure(FailureKind::Listing, e.to_string()))?;
        if !payload.has_manifest() {
            warn!(
                "no manifest found next to {}",
                descriptor.instance_path.display()
            );
        }

        let response = self
            .transport
            .submit(&self.endpoint, descriptor, &payload)
            .await
            .map_err(|e| failure(FailureKind::Transport, e.to_string()))?;

        if response.is_confirmed_for(&self.endpoint) {
            Ok(())
        } else {
            let reason = format!(
                "server answered {} with location {:?}",
                response.status, response.location
            );
            Err(failure(
                FailureKind::Rejected {
                    status: response.status,
                    location: response.location,
                },
                reason,
            ))
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn UploadListener>> {
        self.listener.lock().clone()
    }

    fn deliver_progress(&self, current: usize, total: usize) {
        if let Some(listener) = self.current_listener() {
            listener.progress_update(current, total);
        }
    }

    fn deliver_complete(&self, uploaded: &[PathBuf]) {
        if let Some(listener) = self.current_listener() {
            listener.uploading_complete(uploaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::payload::SubmissionPayload;
    use crate::upload::transport::SubmissionResponse;
    use std::collections::VecDeque;

    const ENDPOINT: &str = "https://host/submission";

    enum Scripted {
        Confirm,
        Reject(u16),
        Fail,
    }

    /// Answers submissions from a script and records what was attempted.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        attempted: Mutex<Vec<PathBuf>>,
        events: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn attempted(&self) -> Vec<PathBuf> {
            self.attempted.lock().clone()
        }
    }

    #[async_trait]
    impl SubmissionTransport for ScriptedTransport {
        async fn submit(
            &self,
            endpoint: &str,
            descriptor: &InstanceDescriptor,
            _payload: &SubmissionPayload,
        ) -> CollectResult<SubmissionResponse> {
            self.attempted.lock().push(descriptor.instance_path.clone());
            if let Some(events) = &self.events {
                events.lock().push("submit".to_string());
            }
            let next = self.script.lock().pop_front().unwrap_or(Scripted::Confirm);
            match next {
                Scripted::Confirm => Ok(SubmissionResponse::new(201, Some(endpoint))),
                Scripted::Reject(status) => Ok(SubmissionResponse::new(status, None)),
                Scripted::Fail => Err(CollectError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            }
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        progress: Mutex<Vec<(usize, usize)>>,
        completed: Mutex<Option<Vec<PathBuf>>>,
        on_progress: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
    }

    impl UploadListener for RecordingListener {
        fn progress_update(&self, current: usize, total: usize) {
            self.progress.lock().push((current, total));
            if let Some(hook) = self.on_progress.lock().as_ref() {
                hook(current);
            }
        }

        fn uploading_complete(&self, uploaded: &[PathBuf]) {
            *self.completed.lock() = Some(uploaded.to_vec());
        }
    }

    fn batch(dir: &tempfile::TempDir, n: usize) -> Vec<InstanceDescriptor> {
        (0..n)
            .map(|i| {
                let name = format!("survey_[AB1234]_2020-01-0{}_10-00-00", i + 1);
                let inst = dir.path().join(&name);
                std::fs::create_dir_all(&inst).unwrap();
                let manifest = inst.join(format!("{name}.xml"));
                std::fs::write(&manifest, "<data/>").unwrap();
                InstanceDescriptor::new("AB1234", "Gulu", manifest)
            })
            .collect()
    }

    fn paths(items: &[InstanceDescriptor]) -> Vec<PathBuf> {
        items.iter().map(|d| d.instance_path.clone()).collect()
    }

    #[tokio::test]
    async fn test_abort_on_connection_error_skips_rest() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 3);
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Confirm,
            Scripted::Fail,
            Scripted::Confirm,
        ]));
        let pipeline = UploadPipeline::new(ENDPOINT, FailurePolicy::AbortBatch, transport.clone());
        let listener = Arc::new(RecordingListener::default());
        pipeline.set_listener(Some(listener.clone()));

        let report = pipeline.run(items.clone()).await.unwrap();
        assert_eq!(report.state, BatchState::Aborted);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.uploaded, vec![items[0].instance_path.clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].kind, FailureKind::Transport);
        assert_eq!(transport.attempted(), paths(&items[..2]));

        assert_eq!(*listener.progress.lock(), vec![(1, 3), (2, 3)]);
        assert_eq!(
            listener.completed.lock().clone(),
            Some(vec![items[0].instance_path.clone()])
        );
        assert_eq!(pipeline.state(), BatchState::Aborted);
    }

    #[tokio::test]
    async fn test_skip_policy_continues_past_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 3);
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Reject(200),
            Scripted::Fail,
            Scripted::Confirm,
        ]));
        let pipeline = UploadPipeline::new(ENDPOINT, FailurePolicy::SkipItem, transport.clone());

        let report = pipeline.run(items.clone()).await.unwrap();
        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.uploaded, vec![items[2].instance_path.clone()]);
        assert_eq!(
            report.failures[0].kind,
            FailureKind::Rejected {
                status: 200,
                location: None
            }
        );
        assert_eq!(report.failures[1].kind, FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_even_when_skipping() {
        let dir = tempfile::tempdir().unwrap();
        let mut items = batch(&dir, 2);
        items.insert(
            0,
            InstanceDescriptor::new("AB1234", "Gulu", dir.path().join("gone").join("x.xml")),
        );
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let pipeline = UploadPipeline::new(ENDPOINT, FailurePolicy::SkipItem, transport.clone());

        let report = pipeline.run(items).await.unwrap();
        assert_eq!(report.state, BatchState::Aborted);
        assert_eq!(report.failures[0].kind, FailureKind::Listing);
        assert!(report.uploaded.is_empty());
        assert!(transport.attempted().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_honoured_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 3);
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            transport.clone(),
        ));
        let listener = Arc::new(RecordingListener::default());
        let weak = Arc::downgrade(&pipeline);
        *listener.on_progress.lock() = Some(Box::new(move |current| {
            if current == 1 {
                if let Some(p) = weak.upgrade() {
                    p.cancel();
                }
            }
        }));
        pipeline.set_listener(Some(listener.clone()));

        let report = pipeline.run(items.clone()).await.unwrap();
        assert_eq!(report.state, BatchState::Cancelled);
        assert_eq!(report.uploaded, vec![items[0].instance_path.clone()]);
        assert_eq!(transport.attempted().len(), 1);
        assert_eq!(*listener.progress.lock(), vec![(1, 3)]);
    }

    #[tokio::test]
    async fn test_listener_rebinding_mid_batch() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 2);
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(ScriptedTransport::new(vec![])),
        ));
        let first = Arc::new(RecordingListener::default());
        let second = Arc::new(RecordingListener::default());
        let weak = Arc::downgrade(&pipeline);
        let replacement: Arc<dyn UploadListener> = second.clone();
        *first.on_progress.lock() = Some(Box::new(move |_| {
            if let Some(p) = weak.upgrade() {
                p.set_listener(Some(replacement.clone()));
            }
        }));
        pipeline.set_listener(Some(first.clone()));

        pipeline.run(items.clone()).await.unwrap();
        assert_eq!(*first.progress.lock(), vec![(1, 2)]);
        assert!(first.completed.lock().is_none());
        assert_eq!(*second.progress.lock(), vec![(2, 2)]);
        assert_eq!(second.completed.lock().clone(), Some(paths(&items)));
    }

    #[tokio::test]
    async fn test_second_start_is_busy() {
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(ScriptedTransport::new(vec![])),
        ));
        let _guard = pipeline.begin().unwrap();
        assert!(matches!(
            pipeline.run(vec![]).await,
            Err(CollectError::PipelineBusy)
        ));
        assert!(matches!(
            pipeline.spawn(vec![]),
            Err(CollectError::PipelineBusy)
        ));
    }

    /// Sleeps far longer than any test waits.
    struct StalledTransport;

    #[async_trait]
    impl SubmissionTransport for StalledTransport {
        async fn submit(
            &self,
            endpoint: &str,
            _descriptor: &InstanceDescriptor,
            _payload: &SubmissionPayload,
        ) -> CollectResult<SubmissionResponse> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(SubmissionResponse::new(201, Some(endpoint)))
        }
    }

    #[tokio::test]
    async fn test_dropped_batch_frees_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 2);
        let pipeline = UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(StalledTransport),
        );

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            pipeline.run(items),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(pipeline.state(), BatchState::Aborted);

        let next = pipeline.run(vec![]).await.unwrap();
        assert_eq!(next.state, BatchState::Completed);
    }

    #[tokio::test]
    async fn test_aborted_spawn_after_cancel_reads_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 1);
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(StalledTransport),
        ));

        let handle = pipeline.spawn(items).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pipeline.cancel();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(pipeline.state(), BatchState::Cancelled);
        assert!(pipeline.run(vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_wedge() {
        struct Exploding;
        impl UploadListener for Exploding {
            fn progress_update(&self, _current: usize, _total: usize) {
                panic!("listener bug");
            }
            fn uploading_complete(&self, _uploaded: &[PathBuf]) {}
        }

        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 1);
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(ScriptedTransport::new(vec![])),
        ));
        pipeline.set_listener(Some(Arc::new(Exploding)));

        let joined = pipeline.spawn(items).unwrap().await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(pipeline.state(), BatchState::Aborted);

        pipeline.set_listener(None);
        let next = pipeline.run(vec![]).await.unwrap();
        assert_eq!(next.state, BatchState::Completed);
    }

    #[tokio::test]
    async fn test_spawned_batch_completes() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 2);
        let pipeline = Arc::new(UploadPipeline::new(
            ENDPOINT,
            FailurePolicy::AbortBatch,
            Arc::new(ScriptedTransport::new(vec![])),
        ));
        let report = pipeline.spawn(items.clone()).unwrap().await.unwrap();
        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.uploaded, paths(&items));
        assert!(pipeline.state().is_terminal());

        // A finished pipeline accepts the next batch.
        let again = pipeline.run(vec![]).await.unwrap();
        assert_eq!(again.state, BatchState::Completed);
        assert_eq!(again.total, 0);
    }

    struct RecordingQueue {
        events: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl RegistrationQueue for RecordingQueue {
        async fn flush_pending(&self, base_url: &str) -> CollectResult<usize> {
            self.events.lock().push(format!("flush {base_url}"));
            if self.fail {
                Err(CollectError::Config("offline".to_string()))
            } else {
                Ok(2)
            }
        }
    }

    #[tokio::test]
    async fn test_registrations_flush_before_first_item() {
        let dir = tempfile::tempdir().unwrap();
        let items = batch(&dir, 1);
        for fail in [false, true] {
            let events = Arc::new(Mutex::new(Vec::new()));
            let transport = ScriptedTransport {
                events: Some(events.clone()),
                ..Default::default()
            };
            let pipeline =
                UploadPipeline::new(ENDPOINT, FailurePolicy::AbortBatch, Arc::new(transport))
                    .with_registrations(Arc::new(RecordingQueue {
                        events: events.clone(),
                        fail,
                    }));
            let report = pipeline.run(items.clone()).await.unwrap();
            assert_eq!(report.state, BatchState::Completed);
            assert_eq!(
                *events.lock(),
                vec!["flush https://host".to_string(), "submit".to_string()]
            );
        }
    }

    #[test]
    fn test_registration_base_url() {
        assert_eq!(
            registration_base_url("https://host/odk/submission"),
            "https://host/odk"
        );
        assert_eq!(registration_base_url("https://host/upload"), "https://host/upload");
    }
}
