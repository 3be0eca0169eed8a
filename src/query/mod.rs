//! Filtered, sorted and paginated reads against the live snapshot.
//!
//! Every read clones the current `Arc<Snapshot>` and works on that handle
//! alone, so a query never waits on, or observes part of, a refresh.

pub mod sort;
pub mod stats;

use crate::cache::{CacheUninitialized, SnapshotCache};
use crate::market::{MarketRecord, Provenance, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

pub use sort::{SortColumn, SortDirection};
pub use stats::FlowStats;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    CacheUninitialized(#[from] CacheUninitialized),
    #[error("invalid {field} filter: {value}")]
    InvalidFilter { field: &'static str, value: String },
}

/// Filter, sort and page parameters. Absent filters match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordQuery {
    /// Segment id, case-insensitive.
    pub segment: Option<String>,
    /// Classification code, case-insensitive.
    pub classification: Option<String>,
    /// `live` or `synthetic`.
    pub provenance: Option<String>,
    /// Substring of code or name, case- and accent-insensitive.
    #[serde(alias = "query", alias = "search")]
    pub q: Option<String>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    /// Zero-based page index.
    pub page: usize,
    pub page_size: Option<usize>,
}

/// One page of query results plus the totals needed to page through the rest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<MarketRecord>,
    pub total_count: usize,
    pub total_pages: usize,
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortColumn,
    pub sort_dir: SortDirection,
    /// Generation of the snapshot this page was read from.
    pub generation: u64,
}

/// Read-side entry point; clone-cheap.
#[derive(Clone)]
pub struct QueryService {
    cache: SnapshotCache,
}

impl QueryService {
    pub fn new(cache: SnapshotCache) -> Self {
        Self { cache }
    }

    pub fn query(&self, query: &RecordQuery) -> Result<RecordPage, QueryError> {
        let snapshot = self.cache.current()?;
        run_query(&snapshot, query)
    }

    pub fn stats(&self) -> Result<FlowStats, QueryError> {
        let snapshot = self.cache.current()?;
        Ok(FlowStats::compute(&snapshot))
    }
}

/// Run `query` against one snapshot.
pub fn run_query(snapshot: &Snapshot, query: &RecordQuery) -> Result<RecordPage, QueryError> {
    let filter = RecordFilter::from_query(query)?;
    let sort_by = resolve_sort_column(query.sort_by.as_deref());
    let sort_dir = resolve_sort_direction(query.sort_dir.as_deref());
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let mut matched: Vec<&MarketRecord> =
        snapshot.records().filter(|r| filter.matches(r)).collect();
    sort::sort_records(&mut matched, sort_by, sort_dir);

    let total_count = matched.len();
    let total_pages = total_count.div_ceil(page_size);
    let records = matched
        .into_iter()
        .skip(query.page.saturating_mul(page_size))
        .take(page_size)
        .cloned()
        .collect();

    Ok(RecordPage {
        records,
        total_count,
        total_pages,
        page: query.page,
        page_size,
        sort_by,
        sort_dir,
        generation: snapshot.generation(),
    })
}

fn resolve_sort_column(requested: Option<&str>) -> SortColumn {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        None => SortColumn::default(),
        Some(name) => name.parse().unwrap_or_else(|()| {
            debug!(
                requested = name,
                fallback = SortColumn::default().as_str(),
                "Unknown sort field, using default"
            );
            SortColumn::default()
        }),
    }
}

fn resolve_sort_direction(requested: Option<&str>) -> SortDirection {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        None => SortDirection::default(),
        Some(dir) => dir.parse().unwrap_or_else(|()| {
            debug!(requested = dir, "Unknown sort direction, using default");
            SortDirection::default()
        }),
    }
}

/// Lowercase, decompose, and drop combining marks, so "Café" matches "cafe".
pub fn fold_for_search(s: &str) -> String {
    s.to_lowercase()
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect()
}

struct RecordFilter<'q> {
    segment: Option<&'q str>,
    classification: Option<&'q str>,
    provenance: Option<Provenance>,
    text: Option<String>,
}

impl<'q> RecordFilter<'q> {
    fn from_query(query: &'q RecordQuery) -> Result<Self, QueryError> {
        let non_empty = |value: &'q Option<String>| {
            value.as_deref().map(str::trim).filter(|s| !s.is_empty())
        };

        let provenance = non_empty(&query.provenance)
            .map(|value| {
                value.parse::<Provenance>().map_err(|_| QueryError::InvalidFilter {
                    field: "provenance",
                    value: value.to_owned(),
                })
            })
            .transpose()?;

        Ok(Self {
            segment: non_empty(&query.segment),
            classification: non_empty(&query.classification),
            provenance,
            text: non_empty(&query.q).map(fold_for_search),
        })
    }

    fn matches(&self, record: &MarketRecord) -> bool {
        if let Some(segment) = self.segment
            && !record.segment.eq_ignore_ascii_case(segment)
        {
            return false;
        }
        if let Some(classification) = self.classification
            && !record.classification_code.eq_ignore_ascii_case(classification)
        {
            return false;
        }
        if let Some(provenance) = self.provenance
            && record.provenance != provenance
        {
            return false;
        }
        match &self.text {
            None => true,
            Some(needle) => {
                fold_for_search(&record.code).contains(needle.as_str())
                    || fold_for_search(&record.name).contains(needle.as_str())
            }
        }
    }
}
