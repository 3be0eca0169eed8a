//! Outcome records for one refresh cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleTrigger {
    Startup,
    Scheduled,
    Manual,
}

impl CycleTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

/// How a segment's records were obtained in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SegmentOutcome {
    /// Live upstream data.
    Success,
    /// The fetch failed; the fallback batch was used.
    Fallback { reason: String },
    /// The fetch overran its budget or the cycle deadline; the fallback batch was used.
    Timeout,
}

impl SegmentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentReport {
    pub segment: String,
    pub outcome: SegmentOutcome,
    pub record_count: usize,
    pub elapsed_ms: u64,
}

/// One completed execution of the refresh pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCycle {
    pub id: u64,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub segments: Vec<SegmentReport>,
    pub total_records: usize,
    /// Generation of the snapshot this cycle published.
    pub generation: u64,
}

impl RefreshCycle {
    pub fn success_count(&self) -> usize {
        self.count(|o| matches!(o, SegmentOutcome::Success))
    }

    pub fn fallback_count(&self) -> usize {
        self.count(|o| matches!(o, SegmentOutcome::Fallback { .. }))
    }

    pub fn timeout_count(&self) -> usize {
        self.count(|o| matches!(o, SegmentOutcome::Timeout))
    }

    pub fn outcome_for(&self, segment: &str) -> Option<&SegmentOutcome> {
        self.segments
            .iter()
            .find(|r| r.segment == segment)
            .map(|r| &r.outcome)
    }

    fn count(&self, predicate: impl Fn(&SegmentOutcome) -> bool) -> usize {
        self.segments.iter().filter(|r| predicate(&r.outcome)).count()
    }
}
