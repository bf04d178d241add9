//! Collect core library: on-device registry of survey forms and filled-in
//! instances, the reconciliation that keeps it honest against the
//! filesystem, referential-safe deletion, and the batch uploader that ships
//! finished instances to the collection server.
//!
//! [`Collector`] is the entry point for callers; the modules underneath can
//! also be used on their own.

pub mod collector;
pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod store;
pub mod upload;

pub use collector::Collector;
pub use config::{CollectConfig, FailurePolicy, StorageLayout};
pub use errors::{CollectError, CollectResult};
pub use models::{AssetCounts, AssetKind, AssetRecord, AssetStatus, NewAsset, Snapshot};
pub use store::deletion::{DeleteOutcome, DeleteReport, DeletionVerdict};
pub use store::registry::AssetRegistry;
pub use upload::descriptor::InstanceDescriptor;
pub use upload::pipeline::{
    BatchReport, BatchState, RegistrationQueue, UploadListener, UploadPipeline,
};
pub use upload::transport::{HttpTransport, SubmissionTransport};
