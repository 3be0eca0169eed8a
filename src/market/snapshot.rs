//! Immutable point-in-time view across all segments.

use super::{MarketRecord, RecordKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;

/// A complete, immutable set of records. Published once, then only replaced.
#[derive(Debug)]
pub struct Snapshot {
    records: BTreeMap<RecordKey, MarketRecord>,
    generation: u64,
    generated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot directly from records; duplicate keys keep the last record.
    pub fn from_records(
        generation: u64,
        generated_at: DateTime<Utc>,
        records: impl IntoIterator<Item = MarketRecord>,
    ) -> Self {
        let mut builder = SnapshotBuilder::new();
        builder.extend(records);
        builder.build(generation, generated_at)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in key order.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &MarketRecord> {
        self.records.values()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&MarketRecord> {
        self.records.get(key)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Record count per segment id.
    pub fn segment_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for key in self.records.keys() {
            *counts.entry(key.segment.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Accumulates segment outputs into a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    records: BTreeMap<RecordKey, MarketRecord>,
    collisions: usize,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge records in; a key collision replaces the earlier record.
    pub fn extend(&mut self, records: impl IntoIterator<Item = MarketRecord>) {
        for record in records {
            let key = record.key();
            if let Some(previous) = self.records.insert(key, record) {
                self.collisions += 1;
                warn!(
                    segment = %previous.segment,
                    code = %previous.code,
                    "Duplicate record key in refresh cycle, keeping last"
                );
            }
        }
    }

    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build(self, generation: u64, generated_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            records: self.records,
            generation,
            generated_at,
        }
    }
}
