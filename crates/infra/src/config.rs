//! Coordinator configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use genledger_billing::LedgerConfig;

pub const ENV_LOCK_TIMEOUT_MS: &str = "GENLEDGER_LOCK_TIMEOUT_MS";
pub const ENV_MAX_OUTPUT_TOKENS: &str = "GENLEDGER_MAX_OUTPUT_TOKENS";
pub const ENV_WORKER_THREADS: &str = "GENLEDGER_WORKER_THREADS";
pub const ENV_RESERVATION_TTL_SECS: &str = "GENLEDGER_RESERVATION_TTL_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Longest wait for a job's row lock before giving up with `Conflict`.
    /// Read when the job store is built (`InMemoryJobStore::from_config`).
    pub lock_timeout: Duration,
    /// Used when a request leaves `max_output_tokens` at 0.
    pub default_max_output_tokens: u64,
    pub worker_threads: usize,
    pub ledger: LedgerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            default_max_output_tokens: 1024,
            worker_threads: 4,
            ledger: LedgerConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_default_max_output_tokens(mut self, tokens: u64) -> Self {
        self.default_max_output_tokens = tokens;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.ledger = ledger;
        self
    }

    /// Defaults overridden by `GENLEDGER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(tokens) = parse_var::<u64, _>(&lookup, ENV_MAX_OUTPUT_TOKENS) {
            config.default_max_output_tokens = tokens;
        }
        if let Some(threads) = parse_var::<usize, _>(&lookup, ENV_WORKER_THREADS) {
            config = config.with_worker_threads(threads);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_RESERVATION_TTL_SECS) {
            config.ledger = config
                .ledger
                .with_reservation_ttl(Duration::from_secs(secs));
        }

        config
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
