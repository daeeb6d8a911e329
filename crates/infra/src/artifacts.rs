//! Storage for generated output.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use genledger_core::{ArtifactId, ErrorKind, JobId};
use genledger_generation::GeneratedContent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub content: GeneratedContent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact rejected: {0}")]
    Rejected(String),

    #[error("artifact storage unavailable: {0}")]
    Unavailable(String),
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::Rejected(_) => ErrorKind::Invalid,
            ArtifactError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

/// Persists a job's output.
///
/// `persist` is keyed by job: storing output for a job that already has an
/// artifact returns the existing id.
pub trait ArtifactStore: Send + Sync {
    fn persist(&self, job_id: JobId, content: &GeneratedContent) -> Result<ArtifactId, ArtifactError>;

    fn get(&self, artifact_id: ArtifactId) -> Result<Option<Artifact>, ArtifactError>;
}

impl<S> ArtifactStore for Arc<S>
where
    S: ArtifactStore + ?Sized,
{
    fn persist(&self, job_id: JobId, content: &GeneratedContent) -> Result<ArtifactId, ArtifactError> {
        (**self).persist(job_id, content)
    }

    fn get(&self, artifact_id: ArtifactId) -> Result<Option<Artifact>, ArtifactError> {
        (**self).get(artifact_id)
    }
}

#[derive(Debug, Default)]
struct Artifacts {
    by_id: HashMap<ArtifactId, Artifact>,
    by_job: HashMap<JobId, ArtifactId>,
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<Artifacts>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|a| a.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_job(&self, job_id: JobId) -> Result<Option<Artifact>, ArtifactError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .by_job
            .get(&job_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }
}

fn poisoned() -> ArtifactError {
    ArtifactError::Unavailable("artifact store lock poisoned".into())
}

impl ArtifactStore for InMemoryArtifactStore {
    fn persist(&self, job_id: JobId, content: &GeneratedContent) -> Result<ArtifactId, ArtifactError> {
        if content.text.is_empty() {
            return Err(ArtifactError::Rejected(format!("empty output for job {job_id}")));
        }

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if let Some(existing) = inner.by_job.get(&job_id) {
            return Ok(*existing);
        }

        let artifact = Artifact {
            id: ArtifactId::new(),
            job_id,
            content: content.clone(),
            created_at: Utc::now(),
        };
        let id = artifact.id;
        inner.by_job.insert(job_id, id);
        inner.by_id.insert(id, artifact);
        Ok(id)
    }

    fn get(&self, artifact_id: ArtifactId) -> Result<Option<Artifact>, ArtifactError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.by_id.get(&artifact_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_is_idempotent_per_job() {
        let store = InMemoryArtifactStore::new();
        let job_id = JobId::new();
        let content = GeneratedContent::new("chapter one");

        let first = store.persist(job_id, &content).unwrap();
        let second = store.persist(job_id, &GeneratedContent::new("different")).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(first).unwrap().unwrap().content.text, "chapter one");
        assert_eq!(store.for_job(job_id).unwrap().unwrap().id, first);
    }

    #[test]
    fn empty_output_is_rejected() {
        let store = InMemoryArtifactStore::new();
        let err = store.persist(JobId::new(), &GeneratedContent::new("")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(store.is_empty());
    }
}
