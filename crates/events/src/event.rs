use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are facts: immutable once published, and delivered at least once,
/// so every consumer must tolerate duplicates.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "generation.job.completed").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (worker time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
