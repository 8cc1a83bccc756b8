pub mod archive;
pub mod cleanup;
pub mod credentials;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod transfer_engine;
pub mod verifier;

pub use archive::ArchiveBackend;
pub use metadata::MetadataStore;
pub use models::{ArchiveJob, JobState, RemoteEntry};
pub use orchestrator::{BackupOrchestrator, BackupRequest, CleanupPlan};
pub use progress::ProgressTracker;
pub use transfer_engine::{TransferEngine, TransferSession, TransferStatus};
