//! Generation job persistence and execution.
//!
//! - `JobStore`: job rows with per-row exclusive locking and optimistic versions
//! - `GenerationWorkerPool`: runs the generator off the request thread and
//!   reports through the event bus

pub mod executor;
pub mod store;

pub use executor::{DispatchError, GenerationWorkerPool, JobDispatcher, PoolStats};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, LockedJob};
