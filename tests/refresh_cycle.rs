//! End-to-end refresh cycles against scripted upstreams.

mod helpers;

use helpers::{MemoryStore, Script, ScriptedSegment, all_fallback_segments, harness, settings};
use marketflow::data::PersistenceWriter;
use marketflow::market::Provenance;
use marketflow::query::{QueryService, RecordQuery, SortColumn, SortDirection};
use marketflow::refresh::{CycleTrigger, SegmentOutcome, TriggerOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quick() -> marketflow::refresh::AggregatorSettings {
    settings(Duration::from_millis(500), Duration::from_secs(2))
}

#[tokio::test]
async fn every_segment_is_covered_by_live_or_fallback_data() {
    let h = harness(
        vec![
            ScriptedSegment::new("main", "MB", 5, Script::live(12)),
            ScriptedSegment::new("growth", "GB", 7, Script::Refuse),
            ScriptedSegment::new("innovation", "IT", 3, Script::Empty),
        ],
        quick(),
        None,
    );

    let cycle = h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    let snapshot = h.scheduler.cache().current().unwrap();
    let counts = snapshot.segment_counts();

    assert_eq!(counts.get("main"), Some(&12));
    assert_eq!(counts.get("growth"), Some(&7));
    assert_eq!(counts.get("innovation"), Some(&3));
    assert_eq!(cycle.outcome_for("main"), Some(&SegmentOutcome::Success));
    assert!(matches!(
        cycle.outcome_for("innovation"),
        Some(SegmentOutcome::Fallback { reason }) if reason.contains("no records")
    ));
    assert_eq!(cycle.total_records, 22);
}

#[tokio::test]
async fn all_fallback_scenario_pages_through_seventy_records() {
    let h = harness(all_fallback_segments(), quick(), None);
    let cycle = h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    assert_eq!(cycle.total_records, 70);
    assert_eq!(cycle.fallback_count(), 4);

    let queries = QueryService::new(h.scheduler.cache().clone());
    let page = queries
        .query(&RecordQuery {
            page_size: Some(20),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(page.records.len(), 20);
    assert_eq!(page.total_count, 70);
    assert_eq!(page.total_pages, 4);
    assert_eq!(page.sort_by, SortColumn::DailyNetInflow);
    assert_eq!(page.sort_dir, SortDirection::Desc);
    assert!(
        page.records
            .windows(2)
            .all(|w| w[0].daily_net_inflow >= w[1].daily_net_inflow)
    );
    assert!(page.records.iter().all(|r| r.provenance == Provenance::Synthetic));
}

#[tokio::test]
async fn fallback_batches_repeat_across_cycles() {
    let h = harness(all_fallback_segments(), quick(), None);
    h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    let first = h.scheduler.cache().current().unwrap();
    h.scheduler.refresh_now(CycleTrigger::Manual).await.unwrap();
    let second = h.scheduler.cache().current().unwrap();

    assert!(second.generation() > first.generation());
    for (a, b) in first.records().zip(second.records()) {
        assert_eq!(a.key(), b.key());
        assert_eq!(a.total_value, b.total_value);
        assert_eq!(a.daily_net_inflow, b.daily_net_inflow);
    }
}

#[tokio::test]
async fn slow_upstream_times_out_into_fallback() {
    let h = harness(
        vec![
            ScriptedSegment::new("main", "MB", 4, Script::live(6)),
            ScriptedSegment::new("growth", "GB", 9, Script::delayed(6, Duration::from_secs(5))),
        ],
        settings(Duration::from_millis(100), Duration::from_secs(2)),
        None,
    );

    let cycle = h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    assert_eq!(cycle.outcome_for("growth"), Some(&SegmentOutcome::Timeout));

    let snapshot = h.scheduler.cache().current().unwrap();
    let growth: Vec<_> = snapshot.records().filter(|r| r.segment == "growth").collect();
    assert_eq!(growth.len(), 9);
    assert!(growth.iter().all(|r| r.code.starts_with("GB") && r.is_synthetic()));
}

#[tokio::test]
async fn hung_upstream_is_abandoned_at_cycle_deadline() {
    let h = harness(
        vec![
            ScriptedSegment::new("main", "MB", 4, Script::live(6)),
            ScriptedSegment::new("basic", "BT", 5, Script::Hang),
        ],
        settings(Duration::from_secs(60), Duration::from_millis(200)),
        None,
    );

    let start = Instant::now();
    let cycle = h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(cycle.outcome_for("main"), Some(&SegmentOutcome::Success));
    assert_eq!(cycle.outcome_for("basic"), Some(&SegmentOutcome::Timeout));
    assert_eq!(cycle.total_records, 11);
}

#[tokio::test]
async fn overlapping_triggers_make_one_cycle_of_upstream_calls() {
    let h = harness(
        vec![
            ScriptedSegment::new("main", "MB", 2, Script::delayed(3, Duration::from_millis(150))),
            ScriptedSegment::new("growth", "GB", 2, Script::delayed(3, Duration::from_millis(150))),
        ],
        quick(),
        None,
    );

    let mut outcomes = Vec::new();
    for _ in 0..8 {
        outcomes.push(h.scheduler.trigger_refresh(CycleTrigger::Manual));
    }
    let concurrent = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.refresh_now(CycleTrigger::Manual).await })
    };

    let racing = futures::future::join_all(
        (0..4).map(|_| h.scheduler.refresh_now(CycleTrigger::Manual)),
    )
    .await;

    assert!(concurrent.await.unwrap().is_none());
    assert!(racing.iter().all(Option::is_none));
    h.scheduler.wait_idle().await;

    let started = outcomes.iter().filter(|o| o.started()).count();
    assert_eq!(started, 1);
    assert_eq!(outcomes[0], TriggerOutcome::Started);
    assert_eq!(h.total_calls(), 2);
    assert_eq!(h.scheduler.last_cycle().map(|c| c.id), Some(1));
}

#[tokio::test]
async fn published_snapshot_is_persisted_with_retry() {
    let store = Arc::new(MemoryStore::failing_first(1));
    let writer = PersistenceWriter::new(store.clone(), 30);
    let h = harness(all_fallback_segments(), quick(), Some(writer));

    let cycle = h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();
    h.scheduler.writer().unwrap().drain().await;

    assert_eq!(store.row_count(), 70);
    // Three batches of up to 30 rows, the first retried once.
    assert_eq!(store.upsert_calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    let cycles = store.cycles.lock().unwrap();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].id, cycle.id);
}

#[tokio::test]
async fn reads_never_see_a_partial_snapshot() {
    let settings = settings(Duration::from_millis(50), Duration::from_millis(500));
    let h = harness(all_fallback_segments(), settings, None);
    h.scheduler.refresh_now(CycleTrigger::Startup).await.unwrap();

    let queries = QueryService::new(h.scheduler.cache().clone());
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let queries = queries.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let stats = queries.stats().unwrap();
                    assert_eq!(stats.total_records, 70);
                    assert_eq!(stats.per_segment_counts.len(), 4);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for _ in 0..5 {
        h.scheduler.refresh_now(CycleTrigger::Manual).await.unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(h.scheduler.cache().current().unwrap().generation(), 6);
}
