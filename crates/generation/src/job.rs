//! Generation job entity and its state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genledger_billing::{Reservation, ReservationState};
use genledger_core::{
    ArtifactId, DomainError, DomainResult, Entity, IdempotencyKey, JobId, OwnerId, ReservationId,
    SettlementOperation,
};

use crate::progress::Progress;
use crate::request::GenerationRequest;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created with a reservation, waiting for a worker
    Pending,
    /// A worker reported it started
    Processing,
    /// Output persisted
    Completed,
    /// Generation or artifact persistence failed
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-side view of the reservation's state.
///
/// Never set directly: it is always derived from a [`ReservationState`]
/// returned by the ledger, so the two cannot disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    #[default]
    None,
    Reserved,
    Committed,
    Released,
}

impl From<ReservationState> for BillingState {
    fn from(state: ReservationState) -> Self {
        match state {
            ReservationState::Active => BillingState::Reserved,
            ReservationState::Committed => BillingState::Committed,
            ReservationState::Released | ReservationState::Expired => BillingState::Released,
        }
    }
}

/// A long-running content-generation job and the reservation paying for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    id: JobId,
    owner_id: OwnerId,
    status: JobStatus,
    progress: Progress,
    error_message: Option<String>,
    request: GenerationRequest,
    billing_reservation_id: Option<ReservationId>,
    billing_estimated_tokens: u64,
    input_prompt_tokens: u64,
    output_tokens: Option<u64>,
    billing_state: BillingState,
    idempotency_keys: BTreeMap<SettlementOperation, IdempotencyKey>,
    artifact_id: Option<ArtifactId>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// Create a PENDING job backed by a freshly obtained reservation.
    pub fn new(
        id: JobId,
        request: GenerationRequest,
        input_prompt_tokens: u64,
        reservation: &Reservation,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: reservation.owner_id,
            status: JobStatus::Pending,
            progress: Progress::new(),
            error_message: None,
            request,
            billing_reservation_id: Some(reservation.id),
            billing_estimated_tokens: reservation.estimated_tokens,
            input_prompt_tokens,
            output_tokens: None,
            billing_state: BillingState::from(reservation.state),
            idempotency_keys: BTreeMap::new(),
            artifact_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn progress_percentage(&self) -> f64 {
        self.progress.percentage()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn billing_reservation_id(&self) -> Option<ReservationId> {
        self.billing_reservation_id
    }

    pub fn billing_estimated_tokens(&self) -> u64 {
        self.billing_estimated_tokens
    }

    pub fn input_prompt_tokens(&self) -> u64 {
        self.input_prompt_tokens
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.output_tokens
    }

    pub fn billing_state(&self) -> BillingState {
        self.billing_state
    }

    pub fn artifact_id(&self) -> Option<ArtifactId> {
        self.artifact_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Called by job stores after a successful write.
    pub fn increment_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn ensure_active(&self, action: &str) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot {action}: job {} is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// PENDING → PROCESSING. Repeating it while PROCESSING is a no-op.
    pub fn mark_processing(&mut self) -> DomainResult<()> {
        self.ensure_active("start processing")?;
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Processing;
            self.touch();
        }
        Ok(())
    }

    pub fn set_totals(&mut self, total_chunks: Option<u32>, total_tasks: Option<u32>) -> DomainResult<f64> {
        self.ensure_active("declare totals")?;
        let pct = self.progress.set_totals(total_chunks, total_tasks);
        self.touch();
        Ok(pct)
    }

    pub fn apply_task_increment(&mut self, delta: u32, label: impl Into<String>) -> DomainResult<f64> {
        self.ensure_active("record task progress")?;
        let pct = self.progress.apply_task_increment(delta, label);
        self.touch();
        Ok(pct)
    }

    pub fn apply_chunk_increment(&mut self, delta: u32, label: impl Into<String>) -> DomainResult<f64> {
        self.ensure_active("record chunk progress")?;
        let pct = self.progress.apply_chunk_increment(delta, label);
        self.touch();
        Ok(pct)
    }

    /// Record the persisted output and move to COMPLETED at 100%.
    pub fn mark_completed(&mut self, output_tokens: u64, artifact_id: ArtifactId) -> DomainResult<()> {
        self.ensure_active("complete")?;
        self.progress.complete();
        self.output_tokens = Some(output_tokens);
        self.artifact_id = Some(artifact_id);
        self.status = JobStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Move to FAILED. Progress and counters are left as they were.
    pub fn mark_failed(&mut self, message: impl Into<String>) -> DomainResult<()> {
        self.ensure_active("fail")?;
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.touch();
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> DomainResult<()> {
        self.ensure_active("cancel")?;
        self.status = JobStatus::Cancelled;
        self.touch();
        Ok(())
    }

    pub fn idempotency_key(&self, operation: SettlementOperation) -> Option<&IdempotencyKey> {
        self.idempotency_keys.get(&operation)
    }

    /// Key for `operation`, derived and stored on first use and reused after.
    pub fn ensure_idempotency_key(&mut self, operation: SettlementOperation) -> IdempotencyKey {
        let id = self.id;
        self.idempotency_keys
            .entry(operation)
            .or_insert_with(|| IdempotencyKey::for_job(id, operation))
            .clone()
    }

    /// True once `operation` has been settled under this job's stored key.
    pub fn is_settled_by(&self, operation: SettlementOperation) -> bool {
        let state = match operation {
            SettlementOperation::Commit => BillingState::Committed,
            SettlementOperation::Release => BillingState::Released,
        };
        self.billing_state == state && self.idempotency_keys.contains_key(&operation)
    }

    /// Refresh the cached billing state from the ledger's answer.
    pub fn sync_billing_state(&mut self, reservation_state: ReservationState) {
        self.billing_state = BillingState::from(reservation_state);
        self.touch();
    }
}

impl Entity for GenerationJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
