//! Aggregate flow statistics over a snapshot.

use crate::market::Snapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub per_segment_counts: BTreeMap<String, usize>,
    pub total_records: usize,
    pub total_daily_inflow: f64,
    pub total_weekly_inflow: f64,
    pub average_daily_inflow: f64,
    pub average_weekly_inflow: f64,
    /// Records with a strictly positive daily net inflow.
    pub positive_flow_count: usize,
    /// Records with a strictly negative daily net inflow.
    pub negative_flow_count: usize,
    pub synthetic_count: usize,
    pub generation: u64,
    pub generated_at: DateTime<Utc>,
}

impl FlowStats {
    pub fn compute(snapshot: &Snapshot) -> Self {
        let mut total_daily = 0.0;
        let mut total_weekly = 0.0;
        let mut positive = 0;
        let mut negative = 0;
        let mut synthetic = 0;

        for record in snapshot.records() {
            total_daily += record.daily_net_inflow;
            total_weekly += record.latest_7d_inflow;
            if record.daily_net_inflow > 0.0 {
                positive += 1;
            } else if record.daily_net_inflow < 0.0 {
                negative += 1;
            }
            if record.is_synthetic() {
                synthetic += 1;
            }
        }

        let count = snapshot.len();
        let average = |total: f64| if count == 0 { 0.0 } else { total / count as f64 };

        Self {
            per_segment_counts: snapshot
                .segment_counts()
                .into_iter()
                .map(|(segment, n)| (segment.to_owned(), n))
                .collect(),
            total_records: count,
            total_daily_inflow: total_daily,
            total_weekly_inflow: total_weekly,
            average_daily_inflow: average(total_daily),
            average_weekly_inflow: average(total_weekly),
            positive_flow_count: positive,
            negative_flow_count: negative,
            synthetic_count: synthetic,
            generation: snapshot.generation(),
            generated_at: snapshot.generated_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketRecord, Provenance, RecordStatus};

    fn record(segment: &str, code: &str, daily: f64, weekly: f64) -> MarketRecord {
        MarketRecord {
            code: code.to_owned(),
            name: code.to_owned(),
            segment: segment.to_owned(),
            classification_code: "C39".to_owned(),
            classification_name: "Computer & Electronics".to_owned(),
            total_value: 1.0e9,
            daily_net_inflow: daily,
            net_inflow_ratio: 0.0,
            recent_volatility: 1.0,
            latest_7d_inflow: weekly,
            last_updated: Utc::now(),
            status: RecordStatus::Normal,
            provenance: Provenance::Live,
        }
    }

    #[test]
    fn aggregates_flows_and_counts() {
        let snapshot = Snapshot::from_records(
            3,
            Utc::now(),
            vec![
                record("growth", "G1", 100.0, 400.0),
                record("growth", "G2", -50.0, -100.0),
                record("main", "M1", 0.0, 300.0),
                record("main", "M2", 150.0, 200.0),
            ],
        );

        let stats = FlowStats::compute(&snapshot);
        assert_eq!(stats.total_records, 4);
        assert_eq!(stats.per_segment_counts["growth"], 2);
        assert_eq!(stats.per_segment_counts["main"], 2);
        assert_eq!(stats.total_daily_inflow, 200.0);
        assert_eq!(stats.total_weekly_inflow, 800.0);
        assert_eq!(stats.average_daily_inflow, 50.0);
        assert_eq!(stats.average_weekly_inflow, 200.0);
        assert_eq!(stats.positive_flow_count, 2);
        assert_eq!(stats.negative_flow_count, 1);
        assert_eq!(stats.generation, 3);
    }

    #[test]
    fn empty_snapshot_has_zero_averages() {
        let snapshot = Snapshot::from_records(1, Utc::now(), Vec::<MarketRecord>::new());
        let stats = FlowStats::compute(&snapshot);
        assert_eq!(stats.average_daily_inflow, 0.0);
        assert!(stats.per_segment_counts.is_empty());
    }
}
