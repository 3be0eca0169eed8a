//! Shared fixtures: scripted upstream sources and an in-memory record store.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use marketflow::cache::SnapshotCache;
use marketflow::data::{PersistenceWriter, RecordStore};
use marketflow::market::{MarketRecord, Provenance, RecordStatus, Segment};
use marketflow::refresh::{Aggregator, AggregatorSettings, RefreshCycle, RefreshScheduler};
use marketflow::source::{FetchError, SourceFetcher, UpstreamSource};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a [`ScriptedSource`] does on every call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return `n` live records after `delay`.
    Live { count: usize, delay: Duration },
    /// Fail immediately with a connection error.
    Refuse,
    /// Return an empty payload.
    Empty,
    /// Never answer within any reasonable budget.
    Hang,
}

impl Script {
    pub fn live(count: usize) -> Self {
        Self::Live {
            count,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(count: usize, delay: Duration) -> Self {
        Self::Live { count, delay }
    }
}

pub struct ScriptedSource {
    script: Script,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: Script) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                script,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl UpstreamSource for ScriptedSource {
    async fn fetch_records(&self, segment: &Segment) -> Result<Vec<MarketRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Live { count, delay } => {
                tokio::time::sleep(*delay).await;
                Ok((0..*count)
                    .map(|i| live_record(&segment.id, &format!("L{i:05}"), i as f64 * 1.0e5))
                    .collect())
            }
            Script::Refuse => Err(FetchError::ConnectionFailure("connection refused".to_owned())),
            Script::Empty => Ok(Vec::new()),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

pub fn live_record(segment: &str, code: &str, daily: f64) -> MarketRecord {
    MarketRecord {
        code: code.to_owned(),
        name: format!("{code} Industries"),
        segment: segment.to_owned(),
        classification_code: "C39".to_owned(),
        classification_name: "Computer & Electronics".to_owned(),
        total_value: 2.0e9,
        daily_net_inflow: daily,
        net_inflow_ratio: daily / 2.0e9 * 100.0,
        recent_volatility: 2.5,
        latest_7d_inflow: daily * 4.0,
        last_updated: Utc::now(),
        status: RecordStatus::Normal,
        provenance: Provenance::Live,
    }
}

/// One segment with its script.
pub struct ScriptedSegment {
    pub id: &'static str,
    pub prefix: &'static str,
    pub fallback_size: usize,
    pub script: Script,
}

impl ScriptedSegment {
    pub fn new(
        id: &'static str,
        prefix: &'static str,
        fallback_size: usize,
        script: Script,
    ) -> Self {
        Self {
            id,
            prefix,
            fallback_size,
            script,
        }
    }
}

/// A scheduler wired to scripted sources, plus per-segment call counters.
pub struct Harness {
    pub scheduler: RefreshScheduler,
    pub calls: BTreeMap<&'static str, Arc<AtomicUsize>>,
}

impl Harness {
    pub fn total_calls(&self) -> usize {
        self.calls.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

pub fn settings(fetch_timeout: Duration, cycle_deadline: Duration) -> AggregatorSettings {
    AggregatorSettings {
        fetch_timeout,
        cycle_deadline,
        max_concurrent_fetches: 4,
    }
}

pub fn harness(
    segments: Vec<ScriptedSegment>,
    settings: AggregatorSettings,
    writer: Option<PersistenceWriter>,
) -> Harness {
    let mut calls = BTreeMap::new();
    let fetchers = segments
        .into_iter()
        .map(|seg| {
            let (source, counter) = ScriptedSource::new(seg.script);
            calls.insert(seg.id, counter);
            SourceFetcher::new(
                Segment::new(seg.id, seg.id, seg.prefix, seg.fallback_size),
                Arc::new(source),
            )
        })
        .collect();

    let scheduler = RefreshScheduler::new(
        Aggregator::new(fetchers, settings),
        SnapshotCache::new(),
        writer,
        Duration::from_secs(300),
        Duration::from_secs(1),
    );
    Harness { scheduler, calls }
}

/// Four failing segments synthesizing 10/20/15/25 records.
pub fn all_fallback_segments() -> Vec<ScriptedSegment> {
    vec![
        ScriptedSegment::new("main", "MB", 10, Script::Refuse),
        ScriptedSegment::new("growth", "GB", 20, Script::Refuse),
        ScriptedSegment::new("innovation", "IT", 15, Script::Refuse),
        ScriptedSegment::new("basic", "BT", 25, Script::Refuse),
    ]
}

/// Record store keeping rows in memory, optionally failing the first N upserts.
#[derive(Default)]
pub struct MemoryStore {
    pub rows: Mutex<BTreeMap<(String, String), MarketRecord>>,
    pub cycles: Mutex<Vec<RefreshCycle>>,
    pub upsert_calls: AtomicUsize,
    pub fail_first: usize,
}

impl MemoryStore {
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_records(&self, records: &[MarketRecord]) -> anyhow::Result<u64> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("simulated write failure #{call}");
        }
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(
                (record.segment.clone(), record.code.clone()),
                record.clone(),
            );
        }
        Ok(records.len() as u64)
    }

    async fn record_cycle(&self, cycle: &RefreshCycle) -> anyhow::Result<()> {
        self.cycles.lock().unwrap().push(cycle.clone());
        Ok(())
    }
}
