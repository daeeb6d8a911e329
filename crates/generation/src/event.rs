//! Events published by generation workers.
//!
//! Workers only report; the coordinator decides. Every event carries the job
//! id so consumers can route it without inspecting the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genledger_core::JobId;
use genledger_events::Event;

use crate::request::{GeneratedContent, GenerationRequest};

/// Granularity of a progress increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressUnit {
    Task,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    pub job_id: JobId,
    pub occurred_at: DateTime<Utc>,
}

/// The generator's declaration of how much work lies ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    pub job_id: JobId,
    pub total_chunks: Option<u32>,
    pub total_tasks: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub unit: ProgressUnit,
    pub delta: u32,
    pub label: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub content: GeneratedContent,
    /// Request the content was generated for. The coordinator accounts from
    /// its own job row; this is for consumers that do not hold one.
    pub request: GenerationRequest,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub job_id: JobId,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Started(StartEvent),
    Planned(PlanEvent),
    Progress(ProgressEvent),
    Completed(CompletionEvent),
    Failed(FailureEvent),
}

impl GenerationEvent {
    pub fn started(job_id: JobId) -> Self {
        GenerationEvent::Started(StartEvent {
            job_id,
            occurred_at: Utc::now(),
        })
    }

    pub fn planned(job_id: JobId, total_chunks: Option<u32>, total_tasks: Option<u32>) -> Self {
        GenerationEvent::Planned(PlanEvent {
            job_id,
            total_chunks,
            total_tasks,
            occurred_at: Utc::now(),
        })
    }

    pub fn progress(job_id: JobId, unit: ProgressUnit, delta: u32, label: impl Into<String>) -> Self {
        GenerationEvent::Progress(ProgressEvent {
            job_id,
            unit,
            delta,
            label: label.into(),
            occurred_at: Utc::now(),
        })
    }

    pub fn completed(job_id: JobId, content: GeneratedContent, request: GenerationRequest) -> Self {
        GenerationEvent::Completed(CompletionEvent {
            job_id,
            content,
            request,
            occurred_at: Utc::now(),
        })
    }

    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        GenerationEvent::Failed(FailureEvent {
            job_id,
            error: error.into(),
            occurred_at: Utc::now(),
        })
    }

    pub fn job_id(&self) -> JobId {
        match self {
            GenerationEvent::Started(e) => e.job_id,
            GenerationEvent::Planned(e) => e.job_id,
            GenerationEvent::Progress(e) => e.job_id,
            GenerationEvent::Completed(e) => e.job_id,
            GenerationEvent::Failed(e) => e.job_id,
        }
    }
}

impl Event for GenerationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GenerationEvent::Started(_) => "generation.job.started",
            GenerationEvent::Planned(_) => "generation.job.planned",
            GenerationEvent::Progress(_) => "generation.job.progress",
            GenerationEvent::Completed(_) => "generation.job.completed",
            GenerationEvent::Failed(_) => "generation.job.failed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GenerationEvent::Started(e) => e.occurred_at,
            GenerationEvent::Planned(e) => e.occurred_at,
            GenerationEvent::Progress(e) => e.occurred_at,
            GenerationEvent::Completed(e) => e.occurred_at,
            GenerationEvent::Failed(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_routable_for_every_variant() {
        let id = JobId::new();
        let events = [
            GenerationEvent::started(id),
            GenerationEvent::planned(id, Some(3), None),
            GenerationEvent::progress(id, ProgressUnit::Chunk, 1, "chunk 1"),
            GenerationEvent::completed(
                id,
                GeneratedContent::new("done"),
                GenerationRequest::new("p", 10),
            ),
            GenerationEvent::failed(id, "boom"),
        ];

        for event in &events {
            assert_eq!(event.job_id(), id);
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = GenerationEvent::failed(JobId::new(), "model unavailable");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "failed");
        assert_eq!(json["error"], "model unavailable");
        assert_eq!(event.event_type(), "generation.job.failed");
    }
}
