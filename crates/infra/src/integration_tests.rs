//! End-to-end tests for the generation pipeline.
//!
//! Tests: start_generation → worker pool → EventBus → EventConsumer → coordinator → ledger
//!
//! Verifies:
//! - Successful jobs end COMPLETED with usage committed exactly once
//! - Generator failures end FAILED with the reservation released
//! - Job and reservation state never disagree once the pipeline is idle
//! - Redelivered completion events do not double-charge

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use genledger_auth::{InMemoryPrincipalDirectory, Permission, Principal};
    use genledger_billing::{InMemoryTokenLedger, LedgerConfig, LedgerEntryKind, TokenLedger};
    use genledger_core::{Entity, JobId};
    use genledger_events::{EventBus, InMemoryEventBus};
    use genledger_generation::{
        BillingState, GeneratedContent, GenerationError, GenerationEvent, GenerationJob,
        GenerationRequest, Generator, JobStatus, ProgressSink, ProgressUnit,
    };

    use crate::artifacts::InMemoryArtifactStore;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::GenerationCoordinator;
    use crate::jobs::{GenerationWorkerPool, InMemoryJobStore, JobStore};
    use crate::workers::{ConsumerHandle, EventConsumer};

    /// Splits the prompt into words; one task per word. Prompts containing
    /// "explode" fail half-way through.
    struct WordGenerator;

    impl Generator for WordGenerator {
        fn generate(
            &self,
            job: &GenerationJob,
            progress: &mut dyn ProgressSink,
        ) -> Result<GeneratedContent, GenerationError> {
            let words: Vec<&str> = job.request().prompt.split_whitespace().collect();
            progress.plan(None, Some(words.len() as u32));

            let mut out = Vec::with_capacity(words.len());
            for (i, word) in words.iter().enumerate() {
                if *word == "explode" {
                    return Err(GenerationError::ModelFailed(format!("gave up at word {i}")));
                }
                out.push(word.to_uppercase());
                progress.advance(ProgressUnit::Task, 1, word);
            }
            Ok(GeneratedContent::new(out.join(" ")))
        }
    }

    struct Pipeline {
        ledger: Arc<InMemoryTokenLedger>,
        jobs: Arc<InMemoryJobStore>,
        bus: Arc<InMemoryEventBus<GenerationEvent>>,
        pool: Arc<GenerationWorkerPool>,
        coordinator: Arc<GenerationCoordinator>,
        consumer: Option<ConsumerHandle>,
        owner: Principal,
    }

    const QUOTA: u64 = 1_000_000;

    fn pipeline() -> Pipeline {
        let config = CoordinatorConfig::default().with_worker_threads(3);
        let ledger = InMemoryTokenLedger::arc(LedgerConfig::default());
        let jobs = InMemoryJobStore::from_config(&config);
        let bus: Arc<InMemoryEventBus<GenerationEvent>> = Arc::new(InMemoryEventBus::new());
        let principals = Arc::new(InMemoryPrincipalDirectory::new());

        let owner = Principal::new("writer").with_permission(Permission::GENERATION_START);
        principals.register(owner.clone()).unwrap();
        ledger.open_account(owner.id, QUOTA).unwrap();

        let pool = Arc::new(
            GenerationWorkerPool::spawn("gen-worker", config.worker_threads, Arc::new(WordGenerator), bus.clone())
                .unwrap(),
        );
        let coordinator = Arc::new(
            GenerationCoordinator::new(
                ledger.clone(),
                jobs.clone(),
                InMemoryArtifactStore::arc(),
                principals,
                pool.clone(),
            )
            .with_config(config),
        );

        let handler_coordinator = Arc::clone(&coordinator);
        let consumer = EventConsumer::spawn("generation-events", &*bus, move |event: GenerationEvent| {
            handler_coordinator.handle_event(event)
        })
        .unwrap();

        Pipeline {
            ledger,
            jobs,
            bus,
            pool,
            coordinator,
            consumer: Some(consumer),
            owner,
        }
    }

    impl Pipeline {
        /// Wait until every listed job has reached a terminal status.
        fn wait_terminal(&self, ids: &[JobId]) {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let done = ids.iter().all(|id| {
                    self.jobs
                        .find_by_id(*id)
                        .unwrap()
                        .is_some_and(|j| j.status().is_terminal() && j.billing_state() != BillingState::Reserved)
                });
                if done || Instant::now() > deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        fn job(&self, id: JobId) -> GenerationJob {
            self.jobs.find_by_id(id).unwrap().unwrap()
        }

        fn assert_mirrored(&self, id: JobId) {
            let job = self.job(id);
            let reservation = self
                .ledger
                .reservation(job.billing_reservation_id().unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(job.billing_state(), BillingState::from(reservation.state));
        }

        fn available(&self) -> i64 {
            self.ledger.account(self.owner.id).unwrap().unwrap().available
        }

        fn shutdown(mut self) {
            self.pool.shutdown();
            if let Some(consumer) = self.consumer.take() {
                consumer.shutdown();
            }
        }
    }

    #[test]
    fn successful_job_is_completed_and_committed() {
        let p = pipeline();
        let job = p
            .coordinator
            .start_generation("writer", GenerationRequest::new("alpha beta gamma delta", 200))
            .unwrap();
        let id = *job.id();

        p.wait_terminal(&[id]);

        let stored = p.job(id);
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.billing_state(), BillingState::Committed);
        assert_eq!(stored.progress_percentage(), 100.0);
        assert_eq!(stored.progress().completed_tasks(), 4);

        // "ALPHA BETA GAMMA DELTA" is 22 chars → 6 tokens; prompt is 6 tokens too.
        let charged = 6 + 6;
        assert_eq!(p.available(), QUOTA as i64 - charged);
        p.assert_mirrored(id);
        p.shutdown();
    }

    #[test]
    fn generator_failure_releases_reservation() {
        let p = pipeline();
        let job = p
            .coordinator
            .start_generation("writer", GenerationRequest::new("one two explode four", 200))
            .unwrap();
        let id = *job.id();

        p.wait_terminal(&[id]);

        let stored = p.job(id);
        assert_eq!(stored.status(), JobStatus::Failed);
        assert!(stored.error_message().unwrap().contains("gave up at word 2"));
        assert_eq!(stored.progress().completed_tasks(), 2);
        assert_eq!(stored.progress_percentage(), 50.0);
        assert_eq!(stored.billing_state(), BillingState::Released);
        assert_eq!(p.available(), QUOTA as i64);
        p.assert_mirrored(id);
        p.shutdown();
    }

    #[test]
    fn many_jobs_settle_consistently() {
        let p = pipeline();
        let ids: Vec<JobId> = (0..24)
            .map(|i| {
                let prompt = if i % 5 == 0 {
                    format!("job {i} explode")
                } else {
                    format!("job {i} runs fine")
                };
                *p.coordinator
                    .start_generation("writer", GenerationRequest::new(prompt, 50))
                    .unwrap()
                    .id()
            })
            .collect();

        p.wait_terminal(&ids);

        let stats = p.coordinator.stats().unwrap();
        assert_eq!(stats.completed + stats.failed, ids.len());
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.awaiting_settlement, 0);
        for id in &ids {
            p.assert_mirrored(*id);
        }

        let account = p.ledger.account(p.owner.id).unwrap().unwrap();
        assert_eq!(account.reserved, 0);
        assert_eq!(account.available + account.consumed as i64, QUOTA as i64);
        p.shutdown();
    }

    #[test]
    fn redelivered_completion_is_charged_once() {
        let p = pipeline();
        let job = p
            .coordinator
            .start_generation("writer", GenerationRequest::new("repeat after me", 100))
            .unwrap();
        let id = *job.id();
        p.wait_terminal(&[id]);
        let balance = p.available();

        // Started, Planned, 3 × Progress, Completed; then two replays.
        let content = GeneratedContent::new("REPEAT AFTER ME");
        for _ in 0..2 {
            p.bus
                .publish(GenerationEvent::completed(id, content.clone(), job.request().clone()))
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while p.consumer.as_ref().unwrap().stats().processed < 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(p.available(), balance);
        let reservation_id = p.job(id).billing_reservation_id().unwrap();
        let commits = p
            .ledger
            .entries_for(reservation_id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LedgerEntryKind::Commit)
            .count();
        assert_eq!(commits, 1);
        p.shutdown();
    }
}
