//! Fan-out of one refresh cycle across all segment fetchers.
//!
//! Every fetcher runs in its own task, gated by a semaphore that bounds how
//! many upstream requests are in flight at once. The cycle waits for all
//! tasks up to a single shared deadline; tasks still pending at the deadline
//! are aborted and their segment falls back to its synthetic batch. The
//! merged result is returned as a fresh [`Snapshot`], which the caller
//! publishes.

use crate::market::{MarketRecord, Segment, Snapshot, SnapshotBuilder};
use crate::refresh::cycle::{SegmentOutcome, SegmentReport};
use crate::source::{FetchError, SourceFetcher};
use crate::utils::{duration_ms, fmt_duration};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time;
use tracing::{debug, error, warn};

/// Timing and concurrency limits for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    /// Budget for a single segment fetch, counted from when it gets a worker slot.
    pub fetch_timeout: Duration,
    /// Deadline for the whole cycle, shared by all fetches.
    pub cycle_deadline: Duration,
    /// Width of the fetch worker pool.
    pub max_concurrent_fetches: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(8),
            cycle_deadline: Duration::from_secs(20),
            max_concurrent_fetches: 4,
        }
    }
}

/// Result of collecting one cycle: the merged snapshot plus per-segment reports
/// in configuration order.
#[derive(Debug)]
pub struct CycleOutput {
    pub snapshot: Snapshot,
    pub segments: Vec<SegmentReport>,
}

type FetchTaskResult = (Result<Vec<MarketRecord>, FetchError>, Duration);

enum TaskOutcome {
    Finished(Result<Vec<MarketRecord>, FetchError>, Duration),
    Abandoned,
    Panicked(String),
}

/// Aborts every fetch task when a collection is dropped before completing,
/// such as when the owning cycle is cancelled at shutdown.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub struct Aggregator {
    fetchers: Vec<Arc<SourceFetcher>>,
    pool: Arc<Semaphore>,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(fetchers: Vec<SourceFetcher>, settings: AggregatorSettings) -> Self {
        Self {
            fetchers: fetchers.into_iter().map(Arc::new).collect(),
            pool: Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1))),
            settings,
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.fetchers.iter().map(|f| f.segment())
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Run every fetcher concurrently and merge the results.
    ///
    /// Completes when all fetches finish or the cycle deadline elapses,
    /// whichever comes first. Every configured segment contributes records.
    pub async fn collect(&self, generation: u64) -> CycleOutput {
        let cycle_start = Instant::now();
        let deadline = time::Instant::now() + self.settings.cycle_deadline;

        let handles: Vec<_> = self.fetchers.iter().map(|f| self.spawn_fetch(f)).collect();
        let _abort = AbortOnDrop(handles.iter().map(JoinHandle::abort_handle).collect());

        // All tasks are already running; awaiting them in order against one
        // absolute deadline is equivalent to awaiting them together.
        let mut outcomes = Vec::with_capacity(handles.len());
        for mut handle in handles {
            let outcome = match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok((result, elapsed))) => TaskOutcome::Finished(result, elapsed),
                Ok(Err(join_err)) => TaskOutcome::Panicked(join_err.to_string()),
                Err(_elapsed) => {
                    handle.abort();
                    TaskOutcome::Abandoned
                }
            };
            outcomes.push(outcome);
        }

        let generated_at = Utc::now();
        let mut builder = SnapshotBuilder::new();
        let mut reports = Vec::with_capacity(outcomes.len());

        for (fetcher, outcome) in self.fetchers.iter().zip(outcomes) {
            let segment = fetcher.segment().id.as_str();
            let (records, outcome, elapsed) = match outcome {
                TaskOutcome::Finished(Ok(records), elapsed) => {
                    debug!(
                        segment,
                        count = records.len(),
                        duration = fmt_duration(elapsed),
                        "Segment fetched"
                    );
                    (records, SegmentOutcome::Success, elapsed)
                }
                TaskOutcome::Finished(Err(FetchError::Timeout(budget)), elapsed) => {
                    warn!(
                        segment,
                        budget = fmt_duration(budget),
                        "Segment fetch timed out, using fallback"
                    );
                    (
                        fetcher.synthesize(generated_at),
                        SegmentOutcome::Timeout,
                        elapsed,
                    )
                }
                TaskOutcome::Finished(Err(e), elapsed) => {
                    warn!(
                        segment,
                        kind = e.kind(),
                        error = %e,
                        "Segment fetch failed, using fallback"
                    );
                    (
                        fetcher.synthesize(generated_at),
                        SegmentOutcome::Fallback {
                            reason: e.to_string(),
                        },
                        elapsed,
                    )
                }
                TaskOutcome::Abandoned => {
                    warn!(
                        segment,
                        deadline = fmt_duration(self.settings.cycle_deadline),
                        "Segment fetch still pending at cycle deadline, using fallback"
                    );
                    (
                        fetcher.synthesize(generated_at),
                        SegmentOutcome::Timeout,
                        cycle_start.elapsed(),
                    )
                }
                TaskOutcome::Panicked(message) => {
                    error!(segment, error = %message, "Segment fetch task failed, using fallback");
                    (
                        fetcher.synthesize(generated_at),
                        SegmentOutcome::Fallback {
                            reason: format!("fetch task failed: {message}"),
                        },
                        cycle_start.elapsed(),
                    )
                }
            };

            reports.push(SegmentReport {
                segment: segment.to_owned(),
                outcome,
                record_count: records.len(),
                elapsed_ms: duration_ms(elapsed),
            });
            builder.extend(records);
        }

        CycleOutput {
            snapshot: builder.build(generation, generated_at),
            segments: reports,
        }
    }

    fn spawn_fetch(&self, fetcher: &Arc<SourceFetcher>) -> JoinHandle<FetchTaskResult> {
        let fetcher = Arc::clone(fetcher);
        let pool = Arc::clone(&self.pool);
        let budget = self.settings.fetch_timeout;
        tokio::spawn(async move {
            // Held for the duration of the fetch; released on drop, including abort.
            let _permit = pool.acquire_owned().await.ok();
            let start = Instant::now();
            let result = fetcher.fetch(budget).await;
            (result, start.elapsed())
        })
    }
}
