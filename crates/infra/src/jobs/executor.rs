//! Worker pool that runs the generator off the request thread.
//!
//! Workers never touch the ledger or the job store. They publish what
//! happened (`Started`, `Planned`, `Progress`, then `Completed` or `Failed`)
//! and the event consumer hands it to the coordinator.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use genledger_core::{Entity, ErrorKind, JobId};
use genledger_events::EventBus;
use genledger_generation::{GenerationEvent, GenerationJob, Generator, ProgressSink, ProgressUnit};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("worker pool is shut down")]
    Stopped,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unavailable
    }
}

/// Hands a freshly created job to whatever runs the generator.
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, job: GenerationJob) -> Result<(), DispatchError>;
}

impl<D> JobDispatcher for Arc<D>
where
    D: JobDispatcher + ?Sized,
{
    fn dispatch(&self, job: GenerationJob) -> Result<(), DispatchError> {
        (**self).dispatch(job)
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub publish_errors: u64,
}

type Queue = Arc<Mutex<mpsc::Receiver<GenerationJob>>>;

/// Fixed-size pool of generator threads fed by a channel.
#[derive(Debug)]
pub struct GenerationWorkerPool {
    sender: Mutex<Option<mpsc::Sender<GenerationJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl GenerationWorkerPool {
    /// Spawn `threads` workers running `generator` and publishing on `bus`.
    pub fn spawn<B>(
        name: &str,
        threads: usize,
        generator: Arc<dyn Generator>,
        bus: B,
    ) -> std::io::Result<Self>
    where
        B: EventBus<GenerationEvent> + 'static,
    {
        let (tx, rx) = mpsc::channel::<GenerationJob>();
        let queue: Queue = Arc::new(Mutex::new(rx));
        let bus = Arc::new(bus);
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let worker = Worker {
                name: format!("{name}-{i}"),
                queue: Arc::clone(&queue),
                generator: Arc::clone(&generator),
                bus: Arc::clone(&bus),
                stats: Arc::clone(&stats),
            };
            let join = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run())?;
            workers.push(join);
        }

        info!(pool = name, threads = workers.len(), "generation worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop accepting jobs, let queued jobs finish and join every worker.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for join in workers {
            let _ = join.join();
        }
    }
}

impl Drop for GenerationWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl JobDispatcher for GenerationWorkerPool {
    fn dispatch(&self, job: GenerationJob) -> Result<(), DispatchError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = sender.as_ref().ok_or(DispatchError::Stopped)?;
        let job_id = *job.id();
        tx.send(job).map_err(|_| DispatchError::Stopped)?;

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatched += 1;
        debug!(job_id = %job_id, "job dispatched");
        Ok(())
    }
}

struct Worker<B> {
    name: String,
    queue: Queue,
    generator: Arc<dyn Generator>,
    bus: Arc<B>,
    stats: Arc<Mutex<PoolStats>>,
}

impl<B> Worker<B>
where
    B: EventBus<GenerationEvent>,
{
    fn run(self) {
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            match next {
                Ok(job) => self.execute(&job),
                // Sender dropped: pool is shutting down.
                Err(_) => break,
            }
        }
        debug!(worker = %self.name, "generation worker stopped");
    }

    fn execute(&self, job: &GenerationJob) {
        let job_id = *job.id();
        self.publish(GenerationEvent::started(job_id));

        let mut sink = BusProgressSink { job_id, worker: self };
        let outcome = self.generator.generate(job, &mut sink);

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(content) => {
                stats.succeeded += 1;
                drop(stats);
                debug!(worker = %self.name, job_id = %job_id, "generation finished");
                self.publish(GenerationEvent::completed(job_id, content, job.request().clone()));
            }
            Err(e) => {
                stats.failed += 1;
                drop(stats);
                warn!(worker = %self.name, job_id = %job_id, error = %e, "generation failed");
                self.publish(GenerationEvent::failed(job_id, e.to_string()));
            }
        }
    }

    fn publish(&self, event: GenerationEvent) {
        if let Err(e) = self.bus.publish(event) {
            warn!(worker = %self.name, error = ?e, "failed to publish generation event");
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .publish_errors += 1;
        }
    }
}

struct BusProgressSink<'a, B> {
    job_id: JobId,
    worker: &'a Worker<B>,
}

impl<B> ProgressSink for BusProgressSink<'_, B>
where
    B: EventBus<GenerationEvent>,
{
    fn plan(&mut self, total_chunks: Option<u32>, total_tasks: Option<u32>) {
        self.worker
            .publish(GenerationEvent::planned(self.job_id, total_chunks, total_tasks));
    }

    fn advance(&mut self, unit: ProgressUnit, delta: u32, label: &str) {
        self.worker
            .publish(GenerationEvent::progress(self.job_id, unit, delta, label));
    }
}
