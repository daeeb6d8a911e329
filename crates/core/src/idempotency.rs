//! Idempotency keys for ledger settlements.

use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// The two ways a reservation leaves ACTIVE.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementOperation {
    Commit,
    Release,
}

impl SettlementOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOperation::Commit => "commit",
            SettlementOperation::Release => "release",
        }
    }
}

impl core::fmt::Display for SettlementOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token that makes a settlement call replay-safe.
///
/// A key derived with [`IdempotencyKey::for_job`] is deterministic
/// (`"<jobId>:<operation>"`), so redelivered events settle exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_job(job_id: JobId, operation: SettlementOperation) -> Self {
        Self(format!("{job_id}:{operation}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_keys_are_deterministic() {
        let job_id = JobId::new();
        let a = IdempotencyKey::for_job(job_id, SettlementOperation::Commit);
        let b = IdempotencyKey::for_job(job_id, SettlementOperation::Commit);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("{job_id}:commit"));
        assert_ne!(a, IdempotencyKey::for_job(job_id, SettlementOperation::Release));
    }
}
