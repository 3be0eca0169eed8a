//! Sort columns and the record comparator.

use crate::market::MarketRecord;
use serde::Serialize;
use std::cmp::Ordering;
use std::str::FromStr;

/// Sortable record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SortColumn {
    Code,
    Name,
    Segment,
    ClassificationCode,
    ClassificationName,
    TotalValue,
    #[default]
    DailyNetInflow,
    NetInflowRatio,
    RecentVolatility,
    Latest7dInflow,
    LastUpdated,
    Status,
    Provenance,
}

impl SortColumn {
    pub const ALL: [SortColumn; 13] = [
        Self::Code,
        Self::Name,
        Self::Segment,
        Self::ClassificationCode,
        Self::ClassificationName,
        Self::TotalValue,
        Self::DailyNetInflow,
        Self::NetInflowRatio,
        Self::RecentVolatility,
        Self::Latest7dInflow,
        Self::LastUpdated,
        Self::Status,
        Self::Provenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Name => "name",
            Self::Segment => "segment",
            Self::ClassificationCode => "classificationCode",
            Self::ClassificationName => "classificationName",
            Self::TotalValue => "totalValue",
            Self::DailyNetInflow => "dailyNetInflow",
            Self::NetInflowRatio => "netInflowRatio",
            Self::RecentVolatility => "recentVolatility",
            Self::Latest7dInflow => "latest7dInflow",
            Self::LastUpdated => "lastUpdated",
            Self::Status => "status",
            Self::Provenance => "provenance",
        }
    }
}

/// Accepts camelCase, snake_case and kebab-case spellings, case-insensitively.
impl FromStr for SortColumn {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s.chars().filter(|c| *c != '_' && *c != '-').collect();
        Self::ALL
            .into_iter()
            .find(|column| column.as_str().eq_ignore_ascii_case(&folded))
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            _ => Err(()),
        }
    }
}

/// Ascending order on `column`, ties broken by record key.
///
/// Keys are unique within a snapshot, so this is a total order and the
/// descending order is its exact reverse.
pub fn compare(column: SortColumn, a: &MarketRecord, b: &MarketRecord) -> Ordering {
    let primary = match column {
        SortColumn::Code => a.code.cmp(&b.code),
        SortColumn::Name => a.name.cmp(&b.name),
        SortColumn::Segment => a.segment.cmp(&b.segment),
        SortColumn::ClassificationCode => a.classification_code.cmp(&b.classification_code),
        SortColumn::ClassificationName => a.classification_name.cmp(&b.classification_name),
        SortColumn::TotalValue => a.total_value.total_cmp(&b.total_value),
        SortColumn::DailyNetInflow => a.daily_net_inflow.total_cmp(&b.daily_net_inflow),
        SortColumn::NetInflowRatio => a.net_inflow_ratio.total_cmp(&b.net_inflow_ratio),
        SortColumn::RecentVolatility => a.recent_volatility.total_cmp(&b.recent_volatility),
        SortColumn::Latest7dInflow => a.latest_7d_inflow.total_cmp(&b.latest_7d_inflow),
        SortColumn::LastUpdated => a.last_updated.cmp(&b.last_updated),
        SortColumn::Status => a.status.as_str().cmp(b.status.as_str()),
        SortColumn::Provenance => a.provenance.as_str().cmp(b.provenance.as_str()),
    };
    primary.then_with(|| a.cmp_key(b))
}

/// Sort `records` in place by `column` in `direction`.
pub fn sort_records(records: &mut [&MarketRecord], column: SortColumn, direction: SortDirection) {
    match direction {
        SortDirection::Asc => records.sort_unstable_by(|a, b| compare(column, a, b)),
        SortDirection::Desc => records.sort_unstable_by(|a, b| compare(column, b, a)),
    }
}
