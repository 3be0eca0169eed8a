//! Market instrument records and the segments they belong to.
//!
//! A [`MarketRecord`] is identified within a [`Snapshot`] by its [`RecordKey`]
//! (segment + instrument code). Every numeric field is a plain `f64` that is
//! required to be finite, so downstream aggregation never has to deal with
//! missing values.

pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use url::Url;

pub use snapshot::{Snapshot, SnapshotBuilder};

/// A configured market segment (one listing tier among several).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Stable identifier, used in record keys and storage rows.
    pub id: String,
    /// Human-readable name, used for synthetic instrument names.
    pub name: String,
    /// Prefix carried by every synthetic instrument code of this segment.
    pub code_prefix: String,
    /// Upstream endpoint. Segments without one always use the fallback path.
    #[serde(default)]
    pub endpoint: Option<Url>,
    /// Number of substitute records synthesized when the upstream fetch fails.
    #[serde(default = "default_fallback_size")]
    pub fallback_size: usize,
}

fn default_fallback_size() -> usize {
    20
}

impl Segment {
    pub fn new(id: &str, name: &str, code_prefix: &str, fallback_size: usize) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            code_prefix: code_prefix.to_owned(),
            endpoint: None,
            fallback_size,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// Unique identity of a record within a snapshot. Orders by segment, then code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordKey {
    pub segment: String,
    pub code: String,
}

impl RecordKey {
    pub fn new(segment: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            code: code.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment, self.code)
    }
}

/// Where a record's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Live,
    Synthetic,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Synthetic => "synthetic",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(format!("unknown provenance '{other}'")),
        }
    }
}

/// Trading/mapping status of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Mapped to a classification and trading normally.
    Normal,
    /// Trading is suspended.
    Suspended,
    /// No classification mapping is known for the instrument.
    Unmapped,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Suspended => "suspended",
            Self::Unmapped => "unmapped",
        }
    }
}

/// One instrument's reference and flow data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRecord {
    pub code: String,
    pub name: String,
    pub segment: String,
    pub classification_code: String,
    pub classification_name: String,
    pub total_value: f64,
    pub daily_net_inflow: f64,
    /// Daily net inflow as a percentage of total value.
    pub net_inflow_ratio: f64,
    pub recent_volatility: f64,
    #[serde(rename = "latest7dInflow")]
    pub latest_7d_inflow: f64,
    pub last_updated: DateTime<Utc>,
    pub status: RecordStatus,
    pub provenance: Provenance,
}

impl MarketRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.segment.clone(), self.code.clone())
    }

    /// Compare by record key without allocating.
    pub fn cmp_key(&self, other: &Self) -> Ordering {
        (self.segment.as_str(), self.code.as_str())
            .cmp(&(other.segment.as_str(), other.code.as_str()))
    }

    /// The first non-finite metric, if any, by field name.
    pub fn non_finite_metric(&self) -> Option<&'static str> {
        [
            ("totalValue", self.total_value),
            ("dailyNetInflow", self.daily_net_inflow),
            ("netInflowRatio", self.net_inflow_ratio),
            ("recentVolatility", self.recent_volatility),
            ("latest7dInflow", self.latest_7d_inflow),
        ]
        .into_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(name, _)| name)
    }

    pub fn is_synthetic(&self) -> bool {
        self.provenance == Provenance::Synthetic
    }
}
