//! Recurring and on-demand refresh cycles with single-flight protection.

use crate::cache::SnapshotCache;
use crate::data::persistence::PersistenceWriter;
use crate::refresh::aggregator::Aggregator;
use crate::refresh::cycle::{CycleTrigger, RefreshCycle};
use crate::utils::fmt_duration;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// Result of asking for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyInProgress,
    /// The scheduler has been shut down and starts no new cycles.
    ShuttingDown,
}

impl TriggerOutcome {
    pub fn started(self) -> bool {
        matches!(self, Self::Started)
    }
}

struct SchedulerInner {
    aggregator: Aggregator,
    cache: SnapshotCache,
    writer: Option<PersistenceWriter>,
    interval: Duration,
    shutdown_grace: Duration,
    /// Single-flight flag; `true` while a cycle holds the guard.
    running: watch::Sender<bool>,
    /// Id of the most recently started cycle. Doubles as the snapshot generation.
    last_cycle_id: AtomicU64,
    /// Start time of the most recently started cycle, in epoch milliseconds.
    last_started_ms: AtomicI64,
    last_cycle: watch::Sender<Option<RefreshCycle>>,
    cancel: CancellationToken,
}

/// Held for the duration of a cycle; releases the single-flight flag on drop,
/// including when the cycle is cancelled or panics.
struct InFlight(Arc<SchedulerInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.running.send_replace(false);
    }
}

/// Drives refresh cycles. Clone-cheap; all clones share one single-flight guard.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn new(
        aggregator: Aggregator,
        cache: SnapshotCache,
        writer: Option<PersistenceWriter>,
        interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                aggregator,
                cache,
                writer,
                interval,
                shutdown_grace,
                running: watch::Sender::new(false),
                last_cycle_id: AtomicU64::new(0),
                last_started_ms: AtomicI64::new(i64::MIN),
                last_cycle: watch::Sender::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }

    pub fn writer(&self) -> Option<&PersistenceWriter> {
        self.inner.writer.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn is_refreshing(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Summary of the last completed cycle.
    pub fn last_cycle(&self) -> Option<RefreshCycle> {
        self.inner.last_cycle.borrow().clone()
    }

    /// Receiver notified whenever a cycle completes.
    pub fn subscribe_cycles(&self) -> watch::Receiver<Option<RefreshCycle>> {
        self.inner.last_cycle.subscribe()
    }

    fn try_begin(&self) -> Option<InFlight> {
        let acquired = self.inner.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        acquired.then(|| InFlight(Arc::clone(&self.inner)))
    }

    /// Start a cycle in the background unless one is already running.
    pub fn trigger_refresh(&self, trigger: CycleTrigger) -> TriggerOutcome {
        if self.inner.cancel.is_cancelled() {
            debug!(trigger = trigger.as_str(), "Scheduler shut down, ignoring trigger");
            return TriggerOutcome::ShuttingDown;
        }
        let Some(guard) = self.try_begin() else {
            debug!(
                trigger = trigger.as_str(),
                "Refresh already in progress, ignoring trigger"
            );
            return TriggerOutcome::AlreadyInProgress;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = this.inner.cancel.cancelled() => {
                    info!(trigger = trigger.as_str(), "Refresh cycle cancelled");
                }
                _ = this.run_cycle(trigger) => {}
            }
        });
        TriggerOutcome::Started
    }

    /// Run a cycle to completion on the calling task.
    ///
    /// Returns `None` without doing any work if another cycle holds the guard,
    /// or if the scheduler is shutting down.
    pub async fn refresh_now(&self, trigger: CycleTrigger) -> Option<RefreshCycle> {
        if self.inner.cancel.is_cancelled() {
            return None;
        }
        let _guard = self.try_begin()?;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            cycle = self.run_cycle(trigger) => Some(cycle),
        }
    }

    /// Wait until no cycle holds the guard.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.running.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Must only be called while holding an [`InFlight`] guard.
    async fn run_cycle(&self, trigger: CycleTrigger) -> RefreshCycle {
        let id = self.inner.last_cycle_id.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = self.clamp_start(Utc::now());
        let span = info_span!("refresh_cycle", cycle = id, trigger = trigger.as_str());

        async move {
            let start = Instant::now();
            debug!("Refresh cycle started");

            let output = self.inner.aggregator.collect(id).await;
            let snapshot = self.inner.cache.publish(output.snapshot);

            let cycle = RefreshCycle {
                id,
                trigger,
                started_at,
                completed_at: Utc::now().max(started_at),
                segments: output.segments,
                total_records: snapshot.len(),
                generation: snapshot.generation(),
            };

            let degraded = cycle.fallback_count() + cycle.timeout_count();
            if degraded > 0 {
                warn!(
                    records = cycle.total_records,
                    live = cycle.success_count(),
                    fallback = cycle.fallback_count(),
                    timeout = cycle.timeout_count(),
                    duration = fmt_duration(start.elapsed()),
                    "Refresh cycle completed with fallback segments"
                );
            } else {
                info!(
                    records = cycle.total_records,
                    segments = cycle.segments.len(),
                    duration = fmt_duration(start.elapsed()),
                    "Refresh cycle completed"
                );
            }

            if let Some(writer) = &self.inner.writer {
                // Detached: the writer serializes its own jobs.
                drop(writer.spawn(snapshot, cycle.clone()));
            }

            self.inner.last_cycle.send_replace(Some(cycle.clone()));
            cycle
        }
        .instrument(span)
        .await
    }

    /// Clamp a cycle start time so it never precedes the previous cycle's.
    fn clamp_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now_ms = now.timestamp_millis();
        let previous = self
            .inner
            .last_started_ms
            .fetch_max(now_ms, Ordering::SeqCst);
        if previous > now_ms {
            trace!(previous_ms = previous, now_ms, "Clock moved backwards, clamping cycle start");
            DateTime::from_timestamp_millis(previous).unwrap_or(now)
        } else {
            now
        }
    }

    /// Runs the periodic refresh loop until a shutdown signal arrives.
    ///
    /// The startup warm-up cycle is run separately via [`Self::refresh_now`],
    /// so the first scheduled cycle fires one interval after this is called.
    /// Ticks that land while a cycle is still running are skipped.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval = fmt_duration(self.inner.interval),
            "Refresh scheduler started"
        );

        let mut next_run = time::Instant::now() + self.inner.interval;
        loop {
            tokio::select! {
                _ = time::sleep_until(next_run) => {
                    if !self.trigger_refresh(CycleTrigger::Scheduled).started() {
                        trace!("Previous refresh cycle still running, skipping");
                    }
                    next_run = time::Instant::now() + self.inner.interval;
                }
                _ = shutdown_rx.recv() => {
                    info!("Refresh scheduler received shutdown signal");
                    self.shutdown().await;
                    info!("Refresh scheduler exiting gracefully");
                    break;
                }
            }
        }
    }

    /// Cancel any in-flight cycle, then give it and any pending persist jobs
    /// up to the grace period to finish. No new cycles start afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let grace = self.inner.shutdown_grace;
        let settle = async {
            self.wait_idle().await;
            if let Some(writer) = &self.inner.writer {
                writer.drain().await;
            }
        };
        if time::timeout(grace, settle).await.is_err() {
            warn!(
                grace = fmt_duration(grace),
                "Refresh work did not stop within grace period, abandoning"
            );
        } else {
            trace!("Refresh work stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketRecord, Provenance, RecordStatus, Segment};
    use crate::refresh::aggregator::AggregatorSettings;
    use crate::source::{FetchError, SourceFetcher, UpstreamSource};
    use async_trait::async_trait;
    use chrono::SubsecRound;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamSource for Counting {
        async fn fetch_records(&self, segment: &Segment) -> Result<Vec<MarketRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.delay).await;
            Ok(vec![MarketRecord {
                code: format!("{}001", segment.code_prefix),
                name: "Counted".to_owned(),
                segment: segment.id.clone(),
                classification_code: "C39".to_owned(),
                classification_name: "Computer & Electronics".to_owned(),
                total_value: 1.0e9,
                daily_net_inflow: 1.0e6,
                net_inflow_ratio: 0.1,
                recent_volatility: 1.0,
                latest_7d_inflow: 3.0e6,
                last_updated: Utc::now(),
                status: RecordStatus::Normal,
                provenance: Provenance::Live,
            }])
        }
    }

    fn scheduler(delay: Duration, calls: &Arc<AtomicUsize>) -> RefreshScheduler {
        let fetchers = ["a", "b"]
            .into_iter()
            .map(|id| {
                SourceFetcher::new(
                    Segment::new(id, id, &id.to_uppercase(), 2),
                    Arc::new(Counting {
                        delay,
                        calls: Arc::clone(calls),
                    }),
                )
            })
            .collect();
        let aggregator = Aggregator::new(
            fetchers,
            AggregatorSettings {
                fetch_timeout: Duration::from_secs(5),
                cycle_deadline: Duration::from_secs(10),
                max_concurrent_fetches: 4,
            },
        );
        RefreshScheduler::new(
            aggregator,
            SnapshotCache::new(),
            None,
            Duration::from_secs(300),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn refresh_now_publishes_and_records_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::ZERO, &calls);

        let cycle = scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
        assert_eq!(cycle.id, 1);
        assert_eq!(cycle.generation, 1);
        assert_eq!(cycle.total_records, 2);
        assert_eq!(cycle.success_count(), 2);
        assert_eq!(scheduler.cache().current().unwrap().generation(), 1);
        assert_eq!(scheduler.last_cycle(), Some(cycle));
        assert!(!scheduler.is_refreshing());
    }

    #[tokio::test]
    async fn overlapping_triggers_run_one_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::from_millis(100), &calls);

        assert_eq!(
            scheduler.trigger_refresh(CycleTrigger::Manual),
            TriggerOutcome::Started
        );
        for _ in 0..5 {
            assert_eq!(
                scheduler.trigger_refresh(CycleTrigger::Manual),
                TriggerOutcome::AlreadyInProgress
            );
        }
        assert!(scheduler.refresh_now(CycleTrigger::Manual).await.is_none());

        scheduler.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.last_cycle().map(|c| c.id), Some(1));
    }

    #[tokio::test]
    async fn generations_and_start_times_increase() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::ZERO, &calls);

        let first = scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
        let second = scheduler.refresh_now(CycleTrigger::Manual).await.unwrap();
        assert!(second.generation > first.generation);
        assert!(second.started_at >= first.started_at);
    }

    #[test]
    fn start_time_is_clamped_against_previous() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::ZERO, &calls);
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);

        assert_eq!(scheduler.clamp_start(later), later);
        assert_eq!(scheduler.clamp_start(earlier), later.trunc_subsecs(3));
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::from_secs(30), &calls);
        scheduler.cache().publish(crate::market::Snapshot::from_records(
            0,
            Utc::now(),
            Vec::<MarketRecord>::new(),
        ));

        assert!(scheduler.trigger_refresh(CycleTrigger::Manual).started());
        time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        scheduler.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!scheduler.is_refreshing());
        assert_eq!(scheduler.cache().current().unwrap().generation(), 0);
        assert!(scheduler.refresh_now(CycleTrigger::Manual).await.is_none());
    }

    #[tokio::test]
    async fn triggers_after_shutdown_start_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(Duration::ZERO, &calls);
        scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(
            scheduler.trigger_refresh(CycleTrigger::Manual),
            TriggerOutcome::ShuttingDown
        );
        assert!(!scheduler.is_refreshing());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.cache().current().unwrap().generation(), 1);
    }
}
