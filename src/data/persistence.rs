//! Bulk persistence of published snapshots.
//!
//! The writer runs off the read path: readers only ever see the in-memory
//! cache, and a slow or failing database never delays a cycle. Jobs enter a
//! FIFO queue when they are submitted and are written one at a time in that
//! order, so an older snapshot never lands after a newer one.

use crate::market::{MarketRecord, Snapshot};
use crate::refresh::RefreshCycle;
use crate::utils::{fmt_duration, log_if_slow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

const SLOW_PERSIST_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("batch {batch} ({rows} rows) failed to write: {source:#}")]
    BatchWriteFailure {
        batch: usize,
        rows: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Backing storage for market records and cycle summaries.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace every record by `(segment, code)`. Returns rows affected.
    async fn upsert_records(&self, records: &[MarketRecord]) -> anyhow::Result<u64>;

    /// Store a completed cycle summary.
    async fn record_cycle(&self, cycle: &RefreshCycle) -> anyhow::Result<()>;
}

/// Outcome of persisting one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub batches: usize,
    /// Batches that failed once and succeeded on retry.
    pub batches_retried: usize,
    /// Batches that failed twice and were skipped.
    pub batches_failed: usize,
    pub rows_written: u64,
}

struct PersistJob {
    snapshot: Arc<Snapshot>,
    cycle: Option<RefreshCycle>,
    reply: oneshot::Sender<PersistReport>,
}

#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    queue: mpsc::UnboundedSender<PersistJob>,
    /// Held while writing; whoever holds it drains the queue front to back.
    pending: Arc<Mutex<mpsc::UnboundedReceiver<PersistJob>>>,
    jobs: TaskTracker,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            store,
            batch_size: batch_size.max(1),
            queue,
            pending: Arc::new(Mutex::new(pending)),
            jobs: TaskTracker::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Persist a snapshot and its cycle summary in the background.
    ///
    /// The job's place in the write order is fixed before this returns.
    pub fn spawn(
        &self,
        snapshot: Arc<Snapshot>,
        cycle: RefreshCycle,
    ) -> JoinHandle<PersistReport> {
        let reply = self.enqueue(snapshot, Some(cycle));
        let writer = self.clone();
        self.jobs.spawn(async move { writer.complete(reply).await })
    }

    /// Wait for every spawned persist job to finish.
    pub async fn drain(&self) {
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }

    /// Persist a snapshot on the calling task, after every job queued before it.
    pub async fn persist(
        &self,
        snapshot: Arc<Snapshot>,
        cycle: Option<RefreshCycle>,
    ) -> PersistReport {
        let reply = self.enqueue(snapshot, cycle);
        self.complete(reply).await
    }

    fn enqueue(
        &self,
        snapshot: Arc<Snapshot>,
        cycle: Option<RefreshCycle>,
    ) -> oneshot::Receiver<PersistReport> {
        let (reply, rx) = oneshot::channel();
        let job = PersistJob {
            snapshot,
            cycle,
            reply,
        };
        // The receiver lives in `self.pending`, so the queue cannot be closed here.
        if self.queue.send(job).is_err() {
            warn!("Persist queue closed, dropping snapshot");
        }
        rx
    }

    async fn complete(&self, reply: oneshot::Receiver<PersistReport>) -> PersistReport {
        self.run_pending().await;
        reply.await.unwrap_or_else(|_| {
            warn!("Persist job was dropped before it finished");
            PersistReport::default()
        })
    }

    /// Write queued jobs in submission order until the queue is empty.
    async fn run_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Ok(job) = pending.try_recv() {
            let span = info_span!("persist", generation = job.snapshot.generation());
            let report = self
                .write_snapshot(&job.snapshot, job.cycle.as_ref())
                .instrument(span)
                .await;
            // The submitter may have stopped waiting.
            let _ = job.reply.send(report);
        }
    }

    /// Write every record of `snapshot` in fixed-size batches.
    ///
    /// A failing batch is retried once; if the retry fails too the batch is
    /// skipped with a warning and the remaining batches are still written.
    async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        cycle: Option<&RefreshCycle>,
    ) -> PersistReport {
        let start = Instant::now();

        // The snapshot map is not contiguous; batches need owned slices.
        let records: Vec<MarketRecord> = snapshot.records().cloned().collect();
        let mut report = PersistReport::default();

        for (index, chunk) in records.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            match self.write_batch(index, chunk).await {
                Ok((rows, retried)) => {
                    report.rows_written += rows;
                    if retried {
                        report.batches_retried += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Skipping batch after retry failed");
                    report.batches_failed += 1;
                }
            }
        }

        if let Some(cycle) = cycle
            && let Err(e) = self.store.record_cycle(cycle).await
        {
            warn!(error = ?e, cycle = cycle.id, "Failed to store refresh cycle summary");
        }

        log_if_slow(start, SLOW_PERSIST_THRESHOLD, "snapshot persist");
        let elapsed = start.elapsed();
        if report.batches_failed > 0 {
            warn!(
                generation = snapshot.generation(),
                batches = report.batches,
                failed = report.batches_failed,
                rows = report.rows_written,
                duration = fmt_duration(elapsed),
                "Snapshot persisted with failed batches"
            );
        } else {
            info!(
                generation = snapshot.generation(),
                batches = report.batches,
                rows = report.rows_written,
                duration = fmt_duration(elapsed),
                "Snapshot persisted"
            );
        }
        report
    }

    async fn write_batch(
        &self,
        index: usize,
        chunk: &[MarketRecord],
    ) -> Result<(u64, bool), PersistenceError> {
        match self.store.upsert_records(chunk).await {
            Ok(rows) => Ok((rows, false)),
            Err(first) => {
                debug!(batch = index, error = ?first, "Batch write failed, retrying once");
                self.store
                    .upsert_records(chunk)
                    .await
                    .map(|rows| (rows, true))
                    .map_err(|source| PersistenceError::BatchWriteFailure {
                        batch: index,
                        rows: chunk.len(),
                        source,
                    })
            }
        }
    }
}
