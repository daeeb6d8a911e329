use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use genledger_events::{Event, EventBus, Subscription};

/// Consumer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Events handed to the handler, successful or not.
    pub processed: u64,
    pub failed: u64,
}

/// Handle to control and join a background consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request graceful shutdown, wait for the thread and return final counters.
    pub fn shutdown(mut self) -> ConsumerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }
}

/// Generic bus consumer loop.
///
/// - Subscribes before returning, so nothing published afterwards is missed
/// - Applies the handler to every event, in delivery order
/// - Handler errors are logged and counted; the event is not retried
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct EventConsumer;

impl EventConsumer {
    /// Spawn a consumer thread over a new subscription to `bus`.
    ///
    /// `handler` must tolerate duplicates (at-least-once delivery).
    pub fn spawn<M, B, H, E>(name: &str, bus: &B, mut handler: H) -> std::io::Result<ConsumerHandle>
    where
        M: Event,
        B: EventBus<M> + ?Sized,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));

        let thread_name = name.to_string();
        let thread_stats = Arc::clone(&stats);
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || consume(&thread_name, sub, shutdown_rx, &thread_stats, &mut handler))?;

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn consume<M, H, E>(
    name: &str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<ConsumerStats>,
    handler: &mut H,
) where
    M: Event,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Display,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(event) => {
                let event_type = event.event_type();
                let result = handler(event);

                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.processed += 1;
                if let Err(err) = result {
                    s.failed += 1;
                    warn!(consumer = name, event_type, error = %err, "event handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(consumer = name, "event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use genledger_events::InMemoryEventBus;
    use std::time::Instant;

    #[derive(Debug, Clone)]
    struct Tick(u32);

    impl Event for Tick {
        fn event_type(&self) -> &'static str {
            "test.tick"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    fn wait_for(handle: &ConsumerHandle, processed: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().processed < processed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn handler_errors_are_counted_not_retried() {
        let bus = InMemoryEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);

        let handle = EventConsumer::spawn("test-consumer", &bus, move |Tick(n)| {
            seen_in.lock().unwrap().push(n);
            if n % 2 == 0 { Err(format!("even tick {n}")) } else { Ok(()) }
        })
        .unwrap();

        for n in 1..=4 {
            bus.publish(Tick(n)).unwrap();
        }
        wait_for(&handle, 4);

        let stats = handle.shutdown();
        assert_eq!(stats, ConsumerStats { processed: 4, failed: 2 });
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }
}
