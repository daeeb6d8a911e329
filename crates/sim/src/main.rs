//! Drives a batch of generation jobs through the in-memory pipeline and
//! prints the resulting job and ledger state.
//!
//! Environment: `GENLEDGER_SIM_JOBS` (default 20) plus everything
//! `CoordinatorConfig::from_env` reads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{info, warn};

use genledger_auth::{InMemoryPrincipalDirectory, Permission, Principal};
use genledger_billing::{InMemoryTokenLedger, LedgerEntryKind};
use genledger_core::{Entity, JobId};
use genledger_events::InMemoryEventBus;
use genledger_generation::{
    BillingState, GeneratedContent, GenerationError, GenerationEvent, GenerationJob,
    GenerationRequest, Generator, ProgressSink, ProgressUnit,
};
use genledger_infra::{
    CoordinatorConfig, EventConsumer, GenerationCoordinator, GenerationWorkerPool,
    InMemoryArtifactStore, InMemoryJobStore, JobStore,
};

const OWNER_HANDLE: &str = "sim-writer";
const OWNER_QUOTA: u64 = 50_000;

/// Writes one paragraph per sentence of the prompt. A sentence containing
/// "unstable" makes the model give up at that point.
struct ParagraphGenerator {
    delay: Duration,
}

impl Generator for ParagraphGenerator {
    fn generate(
        &self,
        job: &GenerationJob,
        progress: &mut dyn ProgressSink,
    ) -> Result<GeneratedContent, GenerationError> {
        let sentences: Vec<&str> = job
            .request()
            .prompt
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if sentences.is_empty() {
            return Err(GenerationError::InvalidInput("prompt has no sentences".into()));
        }
        progress.plan(Some(sentences.len() as u32), None);

        let mut paragraphs = Vec::with_capacity(sentences.len());
        for (i, sentence) in sentences.iter().enumerate() {
            thread::sleep(self.delay);
            if sentence.contains("unstable") {
                return Err(GenerationError::ModelFailed(format!(
                    "model diverged on paragraph {}",
                    i + 1
                )));
            }
            paragraphs.push(format!("{sentence}, expanded into a full paragraph."));
            progress.advance(ProgressUnit::Chunk, 1, &format!("paragraph {}", i + 1));
        }

        Ok(GeneratedContent::new(paragraphs.join("\n\n"))
            .with_metadata(serde_json::json!({ "paragraphs": paragraphs.len() })))
    }
}

fn prompt_for(i: usize) -> String {
    if i % 7 == 3 {
        format!("Report {i}. Market overview. An unstable forecast. Summary")
    } else {
        format!("Report {i}. Market overview. Regional breakdown. Summary")
    }
}

fn main() -> anyhow::Result<()> {
    genledger_observability::init();

    let config = CoordinatorConfig::from_env();
    let job_count: usize = match std::env::var("GENLEDGER_SIM_JOBS") {
        Ok(v) => v.parse().context("GENLEDGER_SIM_JOBS must be a number")?,
        Err(_) => 20,
    };

    let ledger = InMemoryTokenLedger::arc(config.ledger.clone());
    let jobs = InMemoryJobStore::from_config(&config);
    let bus: Arc<InMemoryEventBus<GenerationEvent>> = Arc::new(InMemoryEventBus::new());
    let principals = Arc::new(InMemoryPrincipalDirectory::new());

    let owner = Principal::new(OWNER_HANDLE)
        .with_email("writer@sim.local")
        .with_permission(Permission::GENERATION_START)
        .with_permission(Permission::GENERATION_CANCEL);
    principals.register(owner.clone())?;
    ledger.open_account(owner.id, OWNER_QUOTA)?;

    let generator = Arc::new(ParagraphGenerator {
        delay: Duration::from_millis(15),
    });
    let pool = Arc::new(
        GenerationWorkerPool::spawn("gen-worker", config.worker_threads, generator, bus.clone())
            .context("failed to start worker pool")?,
    );

    let coordinator = Arc::new(
        GenerationCoordinator::new(
            ledger.clone(),
            jobs.clone(),
            InMemoryArtifactStore::arc(),
            principals,
            pool.clone(),
        )
        .with_config(config.clone()),
    );

    let handler = Arc::clone(&coordinator);
    let consumer = EventConsumer::spawn("generation-events", &*bus, move |event: GenerationEvent| {
        handler.handle_event(event)
    })
    .context("failed to start event consumer")?;

    info!(jobs = job_count, workers = config.worker_threads, "starting simulation");

    let mut ids: Vec<JobId> = Vec::with_capacity(job_count);
    for i in 0..job_count {
        let request = GenerationRequest::new(prompt_for(i), 256)
            .with_client_request_id(format!("sim-{i}"));
        match coordinator.start_generation(OWNER_HANDLE, request) {
            Ok(job) => ids.push(*job.id()),
            Err(e) => warn!(request = i, error = %e, kind = ?e.kind(), "generation request rejected"),
        }
    }

    // Cancel the last accepted job if it has not finished yet.
    if let Some(last) = ids.last().copied() {
        match coordinator.cancel(OWNER_HANDLE, last) {
            Ok(job) => info!(job_id = %last, status = %job.status(), "cancelled job"),
            Err(e) => info!(job_id = %last, error = %e, "job already finished, not cancelled"),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let settled = ids.iter().try_fold(true, |acc, id| {
            let job = jobs.find_by_id(*id)?;
            Ok::<_, genledger_infra::JobStoreError>(
                acc && job.is_some_and(|j| {
                    j.status().is_terminal() && j.billing_state() != BillingState::Reserved
                }),
            )
        })?;
        if settled {
            break;
        }
        if Instant::now() > deadline {
            bail!("jobs did not settle within 30s");
        }
        thread::sleep(Duration::from_millis(20));
    }

    pool.shutdown();
    let consumer_stats = consumer.shutdown();

    let stats = coordinator.stats()?;
    let account = ledger
        .account(owner.id)?
        .context("owner account disappeared")?;
    let journal = ledger.journal()?;
    let commits = journal
        .iter()
        .filter(|e| e.kind == LedgerEntryKind::Commit)
        .count();
    let releases = journal
        .iter()
        .filter(|e| e.kind == LedgerEntryKind::Release)
        .count();

    info!(
        jobs = %serde_json::to_string(&stats)?,
        pool = %serde_json::to_string(&pool.stats())?,
        consumer = %serde_json::to_string(&consumer_stats)?,
        "simulation finished"
    );
    info!(
        available = account.available,
        reserved = account.reserved,
        consumed = account.consumed,
        commits,
        releases,
        journal_entries = journal.len(),
        "ledger summary"
    );

    if account.reserved != 0 {
        bail!("{} tokens still reserved after all jobs settled", account.reserved);
    }
    if account.available + account.consumed as i64 != OWNER_QUOTA as i64 {
        bail!("ledger does not balance: {account:?}");
    }

    Ok(())
}
