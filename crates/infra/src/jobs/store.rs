//! Job storage implementations.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

use genledger_core::{DomainError, Entity, ErrorKind, ExpectedVersion, JobId, OwnerId};
use genledger_generation::{BillingState, GenerationJob, JobStatus};

use crate::config::CoordinatorConfig;
use crate::lock::{RowGuard, RowLockError, RowLocks};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id exists or the owner already used the
    /// request's client request id. On success the job's version is bumped.
    fn insert(&self, job: &mut GenerationJob) -> Result<(), JobStoreError>;

    /// Lock-free snapshot read, for display.
    fn find_by_id(&self, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Read under an exclusive per-row lock held until the handle is dropped.
    fn find_by_id_for_update(&self, job_id: JobId) -> Result<LockedJob, JobStoreError>;

    /// Write back a job read earlier. The stored version must equal the job's.
    fn save(&self, job: &mut GenerationJob) -> Result<(), JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: &mut GenerationJob) -> Result<(), JobStoreError> {
        (**self).insert(job)
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        (**self).find_by_id(job_id)
    }

    fn find_by_id_for_update(&self, job_id: JobId) -> Result<LockedJob, JobStoreError> {
        (**self).find_by_id_for_update(job_id)
    }

    fn save(&self, job: &mut GenerationJob) -> Result<(), JobStoreError> {
        (**self).save(job)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("owner {owner_id} already submitted client request '{client_request_id}'")]
    DuplicateClientRequest {
        owner_id: OwnerId,
        client_request_id: String,
    },

    #[error(transparent)]
    Locked(#[from] RowLockError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobStoreError::NotFound(_) => ErrorKind::NotFound,
            JobStoreError::AlreadyExists(_) | JobStoreError::DuplicateClientRequest { .. } => {
                ErrorKind::IntegrityViolation
            }
            JobStoreError::Locked(e) => e.kind(),
            JobStoreError::Domain(e) => e.kind(),
            JobStoreError::Storage(_) => ErrorKind::Unavailable,
        }
    }
}

/// A job read under its row lock.
///
/// Derefs to the job. The lock is released when this value is dropped, so
/// keep it alive across the whole read-modify-write.
#[derive(Debug)]
pub struct LockedJob {
    job: GenerationJob,
    _guard: RowGuard<JobId>,
}

impl LockedJob {
    pub fn new(job: GenerationJob, guard: RowGuard<JobId>) -> Self {
        Self { job, _guard: guard }
    }

    pub fn into_inner(self) -> GenerationJob {
        self.job
    }
}

impl Deref for LockedJob {
    type Target = GenerationJob;

    fn deref(&self) -> &Self::Target {
        &self.job
    }
}

impl DerefMut for LockedJob {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.job
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed jobs whose commit has not landed yet.
    pub awaiting_settlement: usize,
    /// Failed or cancelled jobs whose reservation is still held.
    pub awaiting_release: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Default)]
struct Rows {
    jobs: HashMap<JobId, GenerationJob>,
    client_requests: HashSet<(OwnerId, String)>,
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    rows: RwLock<Rows>,
    locks: RowLocks<JobId>,
}

impl InMemoryJobStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            locks: RowLocks::new(lock_timeout),
        }
    }

    pub fn arc(lock_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(lock_timeout))
    }

    pub fn from_config(config: &CoordinatorConfig) -> Arc<Self> {
        Self::arc(config.lock_timeout)
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".into())
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: &mut GenerationJob) -> Result<(), JobStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let id = *job.id();
        if rows.jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }

        let client_key = job
            .request()
            .client_request_id
            .clone()
            .map(|cid| (job.owner_id(), cid));
        if let Some(key) = &client_key {
            if rows.client_requests.contains(key) {
                return Err(JobStoreError::DuplicateClientRequest {
                    owner_id: key.0,
                    client_request_id: key.1.clone(),
                });
            }
        }

        job.increment_version();
        if let Some(key) = client_key {
            rows.client_requests.insert(key);
        }
        rows.jobs.insert(id, job.clone());
        Ok(())
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.jobs.get(&job_id).cloned())
    }

    fn find_by_id_for_update(&self, job_id: JobId) -> Result<LockedJob, JobStoreError> {
        let guard = self.locks.acquire(job_id)?;
        let job = self
            .find_by_id(job_id)?
            .ok_or(JobStoreError::NotFound(job_id))?;
        Ok(LockedJob::new(job, guard))
    }

    fn save(&self, job: &mut GenerationJob) -> Result<(), JobStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let id = *job.id();
        let stored = rows.jobs.get(&id).ok_or(JobStoreError::NotFound(id))?;
        ExpectedVersion::Exact(job.version()).check(stored.version())?;

        job.increment_version();
        rows.jobs.insert(id, job.clone());
        Ok(())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut stats = JobStats::default();
        for job in rows.jobs.values() {
            match job.status() {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if job.billing_state() == BillingState::Reserved {
                        stats.awaiting_settlement += 1;
                    }
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    if job.status() == JobStatus::Failed {
                        stats.failed += 1;
                    } else {
                        stats.cancelled += 1;
                    }
                    if job.billing_state() == BillingState::Reserved {
                        stats.awaiting_release += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}
