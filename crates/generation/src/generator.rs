//! Seam to the external generation model.

use std::sync::Arc;

use thiserror::Error;

use genledger_core::ErrorKind;

use crate::event::ProgressUnit;
use crate::job::GenerationJob;
use crate::request::GeneratedContent;

/// Receives progress from a running generator.
///
/// Implementations forward to the event bus; they must not block the
/// generator for long and must never fail it.
pub trait ProgressSink {
    /// Declare the amount of work ahead. `None` leaves a total unset.
    fn plan(&mut self, total_chunks: Option<u32>, total_tasks: Option<u32>);

    /// Report `delta` finished units of the given granularity.
    fn advance(&mut self, unit: ProgressUnit, delta: u32, label: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("invalid generation input: {0}")]
    InvalidInput(String),

    #[error("model failed: {0}")]
    ModelFailed(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::InvalidInput(_) => ErrorKind::Invalid,
            GenerationError::ModelFailed(_) => ErrorKind::Unavailable,
        }
    }
}

/// Produces content for a job.
///
/// Runs on a worker thread; must not touch the ledger or the job store.
pub trait Generator: Send + Sync + 'static {
    fn generate(
        &self,
        job: &GenerationJob,
        progress: &mut dyn ProgressSink,
    ) -> Result<GeneratedContent, GenerationError>;
}

impl<G> Generator for Arc<G>
where
    G: Generator + ?Sized,
{
    fn generate(
        &self,
        job: &GenerationJob,
        progress: &mut dyn ProgressSink,
    ) -> Result<GeneratedContent, GenerationError> {
        (**self).generate(job, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use genledger_billing::Reservation;
    use genledger_core::{JobId, OwnerId};

    use crate::request::GenerationRequest;

    #[derive(Default)]
    struct RecordingSink {
        plans: Vec<(Option<u32>, Option<u32>)>,
        steps: Vec<(ProgressUnit, u32, String)>,
    }

    impl ProgressSink for RecordingSink {
        fn plan(&mut self, total_chunks: Option<u32>, total_tasks: Option<u32>) {
            self.plans.push((total_chunks, total_tasks));
        }

        fn advance(&mut self, unit: ProgressUnit, delta: u32, label: &str) {
            self.steps.push((unit, delta, label.to_string()));
        }
    }

    /// Emits one task per whitespace-separated prompt word.
    struct EchoGenerator;

    impl Generator for EchoGenerator {
        fn generate(
            &self,
            job: &GenerationJob,
            progress: &mut dyn ProgressSink,
        ) -> Result<GeneratedContent, GenerationError> {
            let words: Vec<&str> = job.request().prompt.split_whitespace().collect();
            if words.is_empty() {
                return Err(GenerationError::InvalidInput("empty prompt".into()));
            }
            progress.plan(None, Some(words.len() as u32));
            for word in &words {
                progress.advance(ProgressUnit::Task, 1, word);
            }
            Ok(GeneratedContent::new(words.join(" ").to_uppercase()))
        }
    }

    #[test]
    fn generator_reports_through_sink() {
        let now = Utc::now();
        let reservation =
            Reservation::new(OwnerId::new(), 10, "generation", None, now, now + chrono::Duration::minutes(5));
        let job = GenerationJob::new(JobId::new(), GenerationRequest::new("hello world", 8), 2, &reservation);

        let generator: Arc<dyn Generator> = Arc::new(EchoGenerator);
        let mut sink = RecordingSink::default();
        let content = generator.generate(&job, &mut sink).unwrap();

        assert_eq!(content.text, "HELLO WORLD");
        assert_eq!(sink.plans, vec![(None, Some(2))]);
        assert_eq!(sink.steps.len(), 2);
        assert_eq!(sink.steps[1], (ProgressUnit::Task, 1, "world".to_string()));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(GenerationError::InvalidInput("x".into()).kind(), ErrorKind::Invalid);
        assert_eq!(GenerationError::ModelFailed("x".into()).kind(), ErrorKind::Unavailable);
    }
}
