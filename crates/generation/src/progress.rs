//! Progress model over a job's work counters.
//!
//! Two granularities are tracked: coarse chunks and fine tasks. When tasks are
//! declared (`total_tasks > 0`) they alone drive the percentage; otherwise
//! chunks do; with neither, the percentage keeps its previous value.
//!
//! The percentage is clamped to `[0, 100]`, so counters that overshoot their
//! totals read as 100 rather than leaking past it.

use serde::{Deserialize, Serialize};

/// Counters and derived percentage for one job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    total_chunks: Option<u32>,
    processed_chunks: Option<u32>,
    total_tasks: Option<u32>,
    completed_tasks: Option<u32>,
    percentage: f64,
    current_chunk: Option<String>,
}

/// Percentage implied by the counters, or `None` when no total is declared.
pub fn compute_percentage(
    total_chunks: Option<u32>,
    processed_chunks: Option<u32>,
    total_tasks: Option<u32>,
    completed_tasks: Option<u32>,
) -> Option<f64> {
    let ratio = |done: Option<u32>, total: u32| {
        (f64::from(done.unwrap_or(0)) / f64::from(total) * 100.0).clamp(0.0, 100.0)
    };

    match (total_tasks, total_chunks) {
        (Some(total), _) if total > 0 => Some(ratio(completed_tasks, total)),
        (_, Some(total)) if total > 0 => Some(ratio(processed_chunks, total)),
        _ => None,
    }
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from stored counters; the percentage is derived, not trusted.
    pub fn from_counters(
        total_chunks: Option<u32>,
        processed_chunks: Option<u32>,
        total_tasks: Option<u32>,
        completed_tasks: Option<u32>,
    ) -> Self {
        let mut progress = Self {
            total_chunks,
            processed_chunks,
            total_tasks,
            completed_tasks,
            ..Self::default()
        };
        progress.recompute();
        progress
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn processed_chunks(&self) -> Option<u32> {
        self.processed_chunks
    }

    pub fn total_tasks(&self) -> Option<u32> {
        self.total_tasks
    }

    /// Completed tasks; an unset counter reads as 0.
    pub fn completed_tasks(&self) -> u32 {
        self.completed_tasks.unwrap_or(0)
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn current_chunk(&self) -> Option<&str> {
        self.current_chunk.as_deref()
    }

    /// Recompute the percentage from the counters and return it.
    pub fn recompute(&mut self) -> f64 {
        if let Some(p) = compute_percentage(
            self.total_chunks,
            self.processed_chunks,
            self.total_tasks,
            self.completed_tasks,
        ) {
            self.percentage = p;
        }
        self.percentage
    }

    /// Declare the size of the work. `None` leaves a total untouched.
    pub fn set_totals(&mut self, total_chunks: Option<u32>, total_tasks: Option<u32>) -> f64 {
        if total_chunks.is_some() {
            self.total_chunks = total_chunks;
        }
        if total_tasks.is_some() {
            self.total_tasks = total_tasks;
        }
        self.recompute()
    }

    pub fn apply_task_increment(&mut self, delta: u32, label: impl Into<String>) -> f64 {
        self.completed_tasks = Some(self.completed_tasks().saturating_add(delta));
        self.current_chunk = Some(label.into());
        self.recompute()
    }

    pub fn apply_chunk_increment(&mut self, delta: u32, label: impl Into<String>) -> f64 {
        self.processed_chunks = Some(self.processed_chunks.unwrap_or(0).saturating_add(delta));
        self.current_chunk = Some(label.into());
        self.recompute()
    }

    /// Align counters with their totals and force 100%.
    pub fn complete(&mut self) {
        if let Some(total) = self.total_tasks {
            self.completed_tasks = Some(total);
        }
        if self.total_chunks.is_some() {
            self.processed_chunks = self.total_chunks;
        }
        self.percentage = 100.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tasks_take_precedence_over_chunks() {
        let p = Progress::from_counters(Some(10), Some(5), Some(20), Some(10));
        assert_eq!(p.percentage(), 50.0);

        let p = Progress::from_counters(Some(10), Some(9), Some(20), Some(2));
        assert_eq!(p.percentage(), 10.0);
    }

    #[test]
    fn chunks_drive_progress_without_tasks() {
        let p = Progress::from_counters(Some(10), Some(3), None, None);
        assert_eq!(p.percentage(), 30.0);
    }

    #[test]
    fn zero_task_total_falls_back_to_chunks() {
        let p = Progress::from_counters(Some(4), Some(1), Some(0), Some(0));
        assert_eq!(p.percentage(), 25.0);
    }

    #[test]
    fn no_totals_keeps_previous_percentage() {
        let mut p = Progress::new();
        assert_eq!(p.recompute(), 0.0);

        let mut p = Progress::from_counters(Some(4), Some(2), None, None);
        assert_eq!(p.percentage(), 50.0);
        p.total_chunks = Some(0);
        assert_eq!(p.recompute(), 50.0);
        assert!(!p.percentage().is_nan());
    }

    #[test]
    fn task_increment_treats_unset_as_zero() {
        let mut p = Progress::new();
        p.set_totals(None, Some(8));

        let pct = p.apply_task_increment(2, "section 2");

        assert_eq!(p.completed_tasks(), 2);
        assert_eq!(pct, 25.0);
        assert_eq!(p.current_chunk(), Some("section 2"));
    }

    #[test]
    fn overshooting_counters_clamp_at_100() {
        let mut p = Progress::new();
        p.set_totals(None, Some(3));
        assert_eq!(p.apply_task_increment(5, "extra"), 100.0);
    }

    #[test]
    fn complete_aligns_counters() {
        let mut p = Progress::from_counters(Some(10), Some(4), Some(20), Some(7));
        p.complete();
        assert_eq!(p.completed_tasks(), 20);
        assert_eq!(p.processed_chunks(), Some(10));
        assert_eq!(p.percentage(), 100.0);
    }

    #[test]
    fn complete_without_totals_only_forces_percentage() {
        let mut p = Progress::new();
        p.complete();
        assert_eq!(p.total_tasks(), None);
        assert_eq!(p.completed_tasks(), 0);
        assert_eq!(p.processed_chunks(), None);
        assert_eq!(p.percentage(), 100.0);
    }

    proptest! {
        /// Property: with a positive task total, chunk counters never matter.
        #[test]
        fn task_precedence_law(
            total_tasks in 1u32..1_000,
            completed in 0u32..1_000,
            total_chunks in proptest::option::of(0u32..1_000),
            processed in proptest::option::of(0u32..1_000),
        ) {
            let completed = completed.min(total_tasks);
            let p = Progress::from_counters(total_chunks, processed, Some(total_tasks), Some(completed));
            let expected = f64::from(completed) / f64::from(total_tasks) * 100.0;
            prop_assert_eq!(p.percentage(), expected);
        }

        /// Property: without tasks, progress is the chunk ratio.
        #[test]
        fn chunk_fallback_law(
            total_tasks in proptest::option::of(Just(0u32)),
            total_chunks in 1u32..1_000,
            processed in 0u32..1_000,
        ) {
            let processed = processed.min(total_chunks);
            let p = Progress::from_counters(Some(total_chunks), Some(processed), total_tasks, None);
            let expected = f64::from(processed) / f64::from(total_chunks) * 100.0;
            prop_assert_eq!(p.percentage(), expected);
        }

        /// Property: the percentage always stays within [0, 100].
        #[test]
        fn percentage_is_bounded(
            deltas in prop::collection::vec(0u32..50, 0..20),
            total in 1u32..100,
        ) {
            let mut p = Progress::new();
            p.set_totals(None, Some(total));
            for d in deltas {
                let pct = p.apply_task_increment(d, "tick");
                prop_assert!((0.0..=100.0).contains(&pct));
            }
        }
    }
}
