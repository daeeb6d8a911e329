//! Orchestration of generation jobs against the token ledger.
//!
//! The coordinator is the only writer that moves tokens on behalf of a job:
//!
//! ```text
//! start_generation ── reserve ──▶ insert job ──▶ dispatch
//!                          ▲            │ fails
//!                          └── release ◀┘ ("job-creation-failed")
//!
//! completion event ── lock job ──▶ persist artifact ──▶ mark completed ──▶ commit ──▶ save
//!                                        │ fails
//!                                        └──▶ mark failed ──▶ release ──▶ save
//! ```
//!
//! Every read that precedes a billing transition goes through
//! [`JobStore::find_by_id_for_update`]; the row lock is held until the job
//! has been saved. Settlement keys are derived from the job id, so a
//! redelivered event settles at most once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use genledger_auth::{
    AuthzError, Permission, PrincipalDirectory, PrincipalError, authorize, authorize_owner,
    resolve_principal,
};
use genledger_billing::{CommitResult, LedgerError, ReservationState, TokenLedger};
use genledger_core::{DomainError, Entity, ErrorKind, JobId, SettlementOperation};
use genledger_generation::{
    BillingState, CharRatioEstimator, CompletionEvent, FailureEvent, GenerationEvent, GenerationJob,
    GenerationRequest, JobStatus, PlanEvent, ProgressEvent, ProgressUnit, TokenEstimator,
};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::config::CoordinatorConfig;
use crate::jobs::{DispatchError, JobDispatcher, JobStats, JobStore, JobStoreError};

pub const REASON_GENERATION: &str = "generation";
pub const REASON_COMPLETED: &str = "generation-completed";
pub const REASON_JOB_CREATION_FAILED: &str = "job-creation-failed";
pub const REASON_ARTIFACT_FAILED: &str = "artifact-persistence-failed";
pub const REASON_GENERATION_FAILED: &str = "generation-failed";
pub const REASON_DISPATCH_FAILED: &str = "dispatch-failed";
pub const REASON_CANCELLED: &str = "job-cancelled";
pub const REASON_RELEASE_RETRY: &str = "release-retry";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Principal(#[from] PrincipalError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Job creation failed and the reservation taken for it is still ACTIVE.
    #[error("job creation failed ({original}); releasing its reservation also failed: {compensation}")]
    CompensationFailed {
        original: JobStoreError,
        compensation: LedgerError,
    },

    /// A compensating unit of work stopped half-way; the job and the ledger
    /// may disagree until an operator intervenes.
    #[error("settlement of job {job_id} incomplete at step '{step}': {source}")]
    SettlementIncomplete {
        job_id: JobId,
        step: &'static str,
        #[source]
        source: Box<CoordinatorError>,
    },
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Principal(e) => e.kind(),
            CoordinatorError::Authz(e) => e.kind(),
            CoordinatorError::Ledger(e) => e.kind(),
            CoordinatorError::JobStore(e) => e.kind(),
            CoordinatorError::Artifact(e) => e.kind(),
            CoordinatorError::Dispatch(e) => e.kind(),
            CoordinatorError::Domain(e) => e.kind(),
            CoordinatorError::CompensationFailed { .. }
            | CoordinatorError::SettlementIncomplete { .. } => ErrorKind::Inconsistent,
        }
    }
}

/// What handling a completion event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Output persisted and usage committed.
    Committed(CommitResult),
    /// Already committed under this job's key; nothing was done.
    Replayed,
    /// Output could not be persisted; the job failed and its tokens went back.
    ArtifactFailed,
    /// The job had already ended without output (failed or cancelled). A
    /// reservation it still held has been released.
    Ignored(JobStatus),
}

/// Drives jobs from request to settled reservation.
pub struct GenerationCoordinator {
    ledger: Arc<dyn TokenLedger>,
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    principals: Arc<dyn PrincipalDirectory>,
    dispatcher: Arc<dyn JobDispatcher>,
    estimator: Arc<dyn TokenEstimator>,
    config: CoordinatorConfig,
}

impl core::fmt::Debug for GenerationCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GenerationCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GenerationCoordinator {
    pub fn new(
        ledger: Arc<dyn TokenLedger>,
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        principals: Arc<dyn PrincipalDirectory>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            ledger,
            jobs,
            artifacts,
            principals,
            dispatcher,
            estimator: Arc::new(CharRatioEstimator::default()),
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Request side
    // ─────────────────────────────────────────────────────────────────────

    /// Reserve tokens, create the job and hand it to the workers.
    ///
    /// The acting owner is resolved from `actor`, never taken from the request.
    pub fn start_generation(
        &self,
        actor: &str,
        mut request: GenerationRequest,
    ) -> Result<GenerationJob, CoordinatorError> {
        let principal = resolve_principal(&*self.principals, actor)?;
        authorize(&principal, &Permission::GENERATION_START)?;
        request.validate()?;

        if request.max_output_tokens == 0 {
            request.max_output_tokens = self.config.default_max_output_tokens;
        }
        let input_tokens = self.estimator.count(&request.prompt);
        let estimated = self
            .estimator
            .estimate(input_tokens, request.max_output_tokens);

        let job_id = JobId::new();
        let correlation_id = job_id.to_string();
        let reservation =
            self.ledger
                .reserve(principal.id, estimated, REASON_GENERATION, &correlation_id)?;

        let mut job = GenerationJob::new(job_id, request, input_tokens, &reservation);
        if let Err(original) = self.jobs.insert(&mut job) {
            warn!(
                job_id = %job_id,
                reservation_id = %reservation.id,
                error = %original,
                "job creation failed; releasing reservation"
            );
            let key = job.ensure_idempotency_key(SettlementOperation::Release);
            return match self.ledger.release(
                reservation.id,
                REASON_JOB_CREATION_FAILED,
                &correlation_id,
                &key,
            ) {
                Ok(_) => Err(original.into()),
                Err(compensation) => {
                    error!(
                        job_id = %job_id,
                        reservation_id = %reservation.id,
                        error = %compensation,
                        "reservation left active after failed job creation"
                    );
                    Err(CoordinatorError::CompensationFailed {
                        original,
                        compensation,
                    })
                }
            };
        }

        info!(
            job_id = %job_id,
            owner_id = %principal.id,
            reservation_id = %reservation.id,
            estimated_tokens = estimated,
            "generation job created"
        );

        if let Err(e) = self.dispatcher.dispatch(job.clone()) {
            warn!(job_id = %job_id, error = %e, "dispatch failed; failing job");
            self.fail_and_release(job_id, &e.to_string(), REASON_DISPATCH_FAILED)?;
            return Err(e.into());
        }

        Ok(job)
    }

    /// Owner-initiated cancellation. Releases the reservation.
    pub fn cancel(&self, actor: &str, job_id: JobId) -> Result<GenerationJob, CoordinatorError> {
        let principal = resolve_principal(&*self.principals, actor)?;
        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        authorize_owner(&principal, &Permission::GENERATION_CANCEL, job.owner_id())?;

        if job.status().is_terminal() {
            return Err(DomainError::conflict(format!(
                "job {job_id} is already {}",
                job.status()
            ))
            .into());
        }

        job.mark_cancelled()?;
        self.release_and_save(&mut job, REASON_CANCELLED)?;
        info!(job_id = %job_id, actor = %principal.id, "generation job cancelled");
        Ok(job.into_inner())
    }

    /// Lock-free snapshot, for status display.
    pub fn get(&self, job_id: JobId) -> Result<GenerationJob, CoordinatorError> {
        self.jobs
            .find_by_id(job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id).into())
    }

    pub fn stats(&self) -> Result<JobStats, CoordinatorError> {
        Ok(self.jobs.stats()?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Worker side
    // ─────────────────────────────────────────────────────────────────────

    /// Route one worker event.
    pub fn handle_event(&self, event: GenerationEvent) -> Result<(), CoordinatorError> {
        match event {
            GenerationEvent::Started(e) => self.record_started(e.job_id),
            GenerationEvent::Planned(PlanEvent {
                job_id,
                total_chunks,
                total_tasks,
                ..
            }) => self.set_totals(job_id, total_chunks, total_tasks).map(|_| ()),
            GenerationEvent::Progress(ProgressEvent {
                job_id,
                unit,
                delta,
                label,
                ..
            }) => self.apply_progress(job_id, unit, delta, &label).map(|_| ()),
            GenerationEvent::Completed(e) => self.handle_completion(e).map(|_| ()),
            GenerationEvent::Failed(e) => self.handle_failure(e),
        }
    }

    pub fn record_started(&self, job_id: JobId) -> Result<(), CoordinatorError> {
        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if job.status() != JobStatus::Pending {
            debug!(job_id = %job_id, status = %job.status(), "start signal ignored");
            return Ok(());
        }
        job.mark_processing()?;
        self.jobs.save(&mut job)?;
        debug!(job_id = %job_id, "generation job processing");
        Ok(())
    }

    /// Declare the work size. Returns the recomputed percentage.
    pub fn set_totals(
        &self,
        job_id: JobId,
        total_chunks: Option<u32>,
        total_tasks: Option<u32>,
    ) -> Result<f64, CoordinatorError> {
        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if job.status().is_terminal() {
            debug!(job_id = %job_id, status = %job.status(), "late plan ignored");
            return Ok(job.progress_percentage());
        }
        let pct = job.set_totals(total_chunks, total_tasks)?;
        self.jobs.save(&mut job)?;
        Ok(pct)
    }

    /// Apply a progress increment. Returns the recomputed percentage.
    pub fn apply_progress(
        &self,
        job_id: JobId,
        unit: ProgressUnit,
        delta: u32,
        label: &str,
    ) -> Result<f64, CoordinatorError> {
        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if job.status().is_terminal() {
            debug!(job_id = %job_id, status = %job.status(), "late progress ignored");
            return Ok(job.progress_percentage());
        }
        let pct = match unit {
            ProgressUnit::Task => job.apply_task_increment(delta, label)?,
            ProgressUnit::Chunk => job.apply_chunk_increment(delta, label)?,
        };
        self.jobs.save(&mut job)?;
        Ok(pct)
    }

    /// Persist the output and commit actual usage.
    ///
    /// If the ledger is unavailable the job is still saved as COMPLETED with
    /// billing RESERVED and the error is returned; nothing is released.
    pub fn handle_completion(
        &self,
        event: CompletionEvent,
    ) -> Result<CompletionOutcome, CoordinatorError> {
        let job_id = event.job_id;
        let mut job = self.jobs.find_by_id_for_update(job_id)?;

        if job.is_settled_by(SettlementOperation::Commit) {
            debug!(job_id = %job_id, "completion replay; already committed");
            return Ok(CompletionOutcome::Replayed);
        }

        match job.status() {
            // Output already stored; an earlier commit did not land.
            JobStatus::Completed => return self.commit_locked(&mut job).map(CompletionOutcome::Committed),
            JobStatus::Failed | JobStatus::Cancelled => {
                let status = job.status();
                if holds_unreleased(&job) {
                    warn!(job_id = %job_id, %status, "ended job still holds its reservation; retrying release");
                    self.release_and_save(&mut job, REASON_RELEASE_RETRY)?;
                } else {
                    debug!(job_id = %job_id, %status, "completion for ended job ignored");
                }
                return Ok(CompletionOutcome::Ignored(status));
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }

        let artifact_id = match self.artifacts.persist(job_id, &event.content) {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "artifact persistence failed; releasing reservation");
                job.mark_failed(e.to_string())?;
                self.release_and_save(&mut job, REASON_ARTIFACT_FAILED)?;
                return Ok(CompletionOutcome::ArtifactFailed);
            }
        };

        let output_tokens = self.estimator.count(&event.content.text);
        job.mark_completed(output_tokens, artifact_id)?;
        info!(
            job_id = %job_id,
            artifact_id = %artifact_id,
            output_tokens,
            "generation job completed"
        );

        self.commit_locked(&mut job).map(CompletionOutcome::Committed)
    }

    /// Generation failed on the worker: fail the job and release its tokens.
    pub fn handle_failure(&self, event: FailureEvent) -> Result<(), CoordinatorError> {
        let mut job = self.jobs.find_by_id_for_update(event.job_id)?;
        if holds_unreleased(&job) {
            warn!(job_id = %event.job_id, status = %job.status(), "ended job still holds its reservation; retrying release");
            return self.release_and_save(&mut job, REASON_RELEASE_RETRY);
        }
        if job.status().is_terminal() {
            debug!(job_id = %event.job_id, status = %job.status(), "failure for ended job ignored");
            return Ok(());
        }
        job.mark_failed(event.error)?;
        self.release_and_save(&mut job, REASON_GENERATION_FAILED)
    }

    /// Operator retry of a commit that failed (e.g. ledger outage).
    ///
    /// A job already committed under its stored key is answered from the
    /// ledger's reservation snapshot; no second commit is issued.
    pub fn commit_usage(&self, actor: &str, job_id: JobId) -> Result<CommitResult, CoordinatorError> {
        let principal = resolve_principal(&*self.principals, actor)?;
        authorize(&principal, &Permission::BILLING_SETTLE)?;

        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if job.status() != JobStatus::Completed {
            return Err(DomainError::conflict(format!(
                "job {job_id} is {}; only completed jobs are committed",
                job.status()
            ))
            .into());
        }
        if job.is_settled_by(SettlementOperation::Commit) {
            debug!(job_id = %job_id, actor = %principal.id, "commit retry on settled job");
            return self.settled_commit(&job);
        }

        info!(job_id = %job_id, actor = %principal.id, "operator commit retry");
        self.commit_locked(&mut job)
    }

    /// Operator retry of a release that failed for a failed or cancelled job.
    pub fn release_usage(&self, actor: &str, job_id: JobId) -> Result<GenerationJob, CoordinatorError> {
        let principal = resolve_principal(&*self.principals, actor)?;
        authorize(&principal, &Permission::BILLING_SETTLE)?;

        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if !matches!(job.status(), JobStatus::Failed | JobStatus::Cancelled) {
            return Err(DomainError::conflict(format!(
                "job {job_id} is {}; only failed or cancelled jobs are released",
                job.status()
            ))
            .into());
        }
        if job.billing_state() == BillingState::Reserved {
            info!(job_id = %job_id, actor = %principal.id, "operator release retry");
            self.release_and_save(&mut job, REASON_RELEASE_RETRY)?;
        }
        Ok(job.into_inner())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Settlement (callers hold the row lock)
    // ─────────────────────────────────────────────────────────────────────

    fn settled_commit(&self, job: &GenerationJob) -> Result<CommitResult, CoordinatorError> {
        let job_id = *job.id();
        let reservation_id = job
            .billing_reservation_id()
            .ok_or_else(|| DomainError::invariant(format!("job {job_id} has no reservation")))?;
        let reservation = self
            .ledger
            .reservation(reservation_id)?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;
        let committed_tokens = reservation.committed_tokens.unwrap_or_else(|| {
            self.estimator
                .actual(job.input_prompt_tokens(), job.output_tokens().unwrap_or(0))
        });

        Ok(CommitResult {
            reservation_id,
            committed_tokens,
            state: reservation.state,
        })
    }

    fn commit_locked(&self, job: &mut GenerationJob) -> Result<CommitResult, CoordinatorError> {
        let job_id = *job.id();
        let reservation_id = job
            .billing_reservation_id()
            .ok_or_else(|| DomainError::invariant(format!("job {job_id} has no reservation")))?;
        let key = job.ensure_idempotency_key(SettlementOperation::Commit);
        let actual = self
            .estimator
            .actual(job.input_prompt_tokens(), job.output_tokens().unwrap_or(0));

        match self.ledger.commit(reservation_id, actual, REASON_COMPLETED, &key) {
            Ok(result) => {
                job.sync_billing_state(result.state);
                self.jobs.save(job)?;
                info!(
                    job_id = %job_id,
                    reservation_id = %reservation_id,
                    committed_tokens = result.committed_tokens,
                    "usage committed"
                );
                Ok(result)
            }
            Err(e) => {
                if let LedgerError::AlreadySettled { state, .. } = &e {
                    job.sync_billing_state(*state);
                }
                error!(
                    job_id = %job_id,
                    reservation_id = %reservation_id,
                    error = %e,
                    billing_state = ?job.billing_state(),
                    "commit failed; needs operator follow-up"
                );
                // Keep the completed status durable; billing stays as the ledger left it.
                self.jobs.save(job)?;
                Err(e.into())
            }
        }
    }

    /// Release the job's reservation, then save the job. A reservation the
    /// reaper already expired counts as released.
    fn release_and_save(&self, job: &mut GenerationJob, reason: &'static str) -> Result<(), CoordinatorError> {
        let job_id = *job.id();
        let released = self.release_locked(job, reason);
        let saved = self.jobs.save(job);

        match (released, saved) {
            (Ok(()), Ok(())) => {
                info!(job_id = %job_id, reason, "reservation released");
                Ok(())
            }
            (Err(e), saved) => {
                if let Err(save_err) = saved {
                    error!(job_id = %job_id, error = %save_err, "job save failed after failed release");
                }
                error!(job_id = %job_id, reason, error = %e, "release failed; job and ledger disagree");
                Err(CoordinatorError::SettlementIncomplete {
                    job_id,
                    step: "release",
                    source: Box::new(e),
                })
            }
            (Ok(()), Err(e)) => {
                error!(job_id = %job_id, reason, error = %e, "tokens released but job not saved");
                Err(CoordinatorError::SettlementIncomplete {
                    job_id,
                    step: "save",
                    source: Box::new(e.into()),
                })
            }
        }
    }

    fn release_locked(&self, job: &mut GenerationJob, reason: &str) -> Result<(), CoordinatorError> {
        let job_id = *job.id();
        let reservation_id = job
            .billing_reservation_id()
            .ok_or_else(|| DomainError::invariant(format!("job {job_id} has no reservation")))?;
        let key = job.ensure_idempotency_key(SettlementOperation::Release);

        match self
            .ledger
            .release(reservation_id, reason, &job_id.to_string(), &key)
        {
            Ok(result) => {
                job.sync_billing_state(result.state);
                Ok(())
            }
            Err(LedgerError::AlreadySettled { state, .. }) if state == ReservationState::Expired => {
                job.sync_billing_state(state);
                Ok(())
            }
            Err(e) => {
                if let LedgerError::AlreadySettled { state, .. } = &e {
                    job.sync_billing_state(*state);
                }
                Err(e.into())
            }
        }
    }

    fn fail_and_release(&self, job_id: JobId, message: &str, reason: &'static str) -> Result<(), CoordinatorError> {
        let mut job = self.jobs.find_by_id_for_update(job_id)?;
        if job.status().is_terminal() {
            return Ok(());
        }
        job.mark_failed(message)?;
        self.release_and_save(&mut job, reason)
    }
}

/// Failed or cancelled, with the reservation still ACTIVE as far as the job knows.
fn holds_unreleased(job: &GenerationJob) -> bool {
    matches!(job.status(), JobStatus::Failed | JobStatus::Cancelled)
        && job.billing_state() == BillingState::Reserved
}
