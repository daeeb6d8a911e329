//! Infrastructure layer: orchestration, in-memory collaborators, worker
//! threads and configuration.
//!
//! Everything here is synchronous: blocking calls on std threads, locks held
//! only for one unit of work.

pub mod artifacts;
pub mod config;
pub mod coordinator;
pub mod jobs;
pub mod lock;
pub mod workers;

mod integration_tests;

pub use artifacts::{Artifact, ArtifactError, ArtifactStore, InMemoryArtifactStore};
pub use config::CoordinatorConfig;
pub use coordinator::{CompletionOutcome, CoordinatorError, GenerationCoordinator};
pub use jobs::{
    DispatchError, GenerationWorkerPool, InMemoryJobStore, JobDispatcher, JobStats, JobStore,
    JobStoreError, LockedJob, PoolStats,
};
pub use lock::{RowGuard, RowLockError, RowLocks};
pub use workers::{ConsumerHandle, ConsumerStats, EventConsumer};
