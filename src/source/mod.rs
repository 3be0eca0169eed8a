//! Per-segment upstream fetching under a time budget, with deterministic
//! substitute data on failure.
//!
//! A [`SourceFetcher`] wraps one segment's [`UpstreamSource`]. It never writes
//! to the cache or to storage: [`SourceFetcher::fetch`] returns either
//! normalized records or a [`FetchError`], and [`SourceFetcher::synthesize`]
//! produces the segment's fallback batch. The aggregator decides which to use.

pub mod fallback;
pub mod http;
mod json;

use crate::market::{MarketRecord, Segment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::trace;

pub use http::HttpSource;

/// Why a single fetch attempt did not produce records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    #[error("upstream connection failed: {0}")]
    ConnectionFailure(String),
    #[error("upstream payload could not be normalized: {0}")]
    ParseFailure(String),
}

impl FetchError {
    /// Short machine-readable kind, used in logs and cycle summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::ConnectionFailure(_) => "connection",
            Self::ParseFailure(_) => "parse",
        }
    }
}

/// One upstream request for a segment, normalized into records.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch_records(&self, segment: &Segment) -> Result<Vec<MarketRecord>, FetchError>;
}

/// Source for segments without a configured endpoint; always fails so the
/// segment is served from its fallback batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSource;

#[async_trait]
impl UpstreamSource for UnconfiguredSource {
    async fn fetch_records(&self, _segment: &Segment) -> Result<Vec<MarketRecord>, FetchError> {
        Err(FetchError::ConnectionFailure(
            "no upstream endpoint configured".to_owned(),
        ))
    }
}

/// Bounded-time fetcher for one segment.
pub struct SourceFetcher {
    segment: Segment,
    source: Arc<dyn UpstreamSource>,
}

impl SourceFetcher {
    pub fn new(segment: Segment, source: Arc<dyn UpstreamSource>) -> Self {
        Self { segment, source }
    }

    /// Pick the source for a segment: HTTP when an endpoint is configured.
    pub fn for_segment(segment: Segment, http: &reqwest::Client) -> Self {
        let source: Arc<dyn UpstreamSource> = match &segment.endpoint {
            Some(endpoint) => Arc::new(HttpSource::new(http.clone(), endpoint.clone())),
            None => Arc::new(UnconfiguredSource),
        };
        Self::new(segment, source)
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Perform one fetch attempt within `budget`.
    ///
    /// An attempt that overruns is abandoned: its future is dropped, which
    /// releases any connection it held. Empty or non-finite payloads are
    /// rejected as parse failures.
    pub async fn fetch(&self, budget: Duration) -> Result<Vec<MarketRecord>, FetchError> {
        let attempt = self.source.fetch_records(&self.segment);
        let mut records = match time::timeout(budget, attempt).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(FetchError::Timeout(budget)),
        };

        if records.is_empty() {
            return Err(FetchError::ParseFailure(
                "upstream returned no records".to_owned(),
            ));
        }

        for record in &mut records {
            if let Some(field) = record.non_finite_metric() {
                return Err(FetchError::ParseFailure(format!(
                    "non-finite {field} for instrument {}",
                    record.code
                )));
            }
            if record.segment != self.segment.id {
                record.segment.clone_from(&self.segment.id);
            }
        }

        trace!(segment = %self.segment.id, count = records.len(), "Fetched upstream records");
        Ok(records)
    }

    /// The segment's deterministic fallback batch.
    pub fn synthesize(&self, generated_at: DateTime<Utc>) -> Vec<MarketRecord> {
        fallback::synthesize(&self.segment, generated_at)
    }
}
