//! HTTP upstream for one segment: a single GET returning a `{"data": [...]}`
//! envelope of instrument rows.

use super::json::decode_payload;
use super::{FetchError, UpstreamSource};
use crate::market::{MarketRecord, Provenance, RecordStatus, Segment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Vec<UpstreamRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamRow {
    code: String,
    name: String,
    #[serde(default, alias = "industryCode")]
    classification_code: Option<String>,
    #[serde(default, alias = "industryName")]
    classification_name: Option<String>,
    total_value: f64,
    #[serde(alias = "netInflow")]
    daily_net_inflow: f64,
    #[serde(default)]
    net_inflow_ratio: Option<f64>,
    #[serde(alias = "volatility")]
    recent_volatility: f64,
    #[serde(rename = "latest7dInflow", alias = "inflow7d")]
    latest_7d_inflow: f64,
    #[serde(default)]
    suspended: bool,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl UpstreamRow {
    fn normalize(self, segment: &Segment, fetched_at: DateTime<Utc>) -> MarketRecord {
        let classification_code = self
            .classification_code
            .map(|c| c.trim().to_owned())
            .unwrap_or_default();
        let status = if self.suspended {
            RecordStatus::Suspended
        } else if classification_code.is_empty() {
            RecordStatus::Unmapped
        } else {
            RecordStatus::Normal
        };
        let net_inflow_ratio = self.net_inflow_ratio.unwrap_or_else(|| {
            if self.total_value > 0.0 {
                self.daily_net_inflow / self.total_value * 100.0
            } else {
                0.0
            }
        });

        MarketRecord {
            code: self.code.trim().to_owned(),
            name: self.name.trim().to_owned(),
            segment: segment.id.clone(),
            classification_code,
            classification_name: self.classification_name.unwrap_or_default(),
            total_value: self.total_value,
            daily_net_inflow: self.daily_net_inflow,
            net_inflow_ratio,
            recent_volatility: self.recent_volatility,
            latest_7d_inflow: self.latest_7d_inflow,
            last_updated: self.updated_at.unwrap_or(fetched_at),
            status,
            provenance: Provenance::Live,
        }
    }
}

/// Fetches one segment's instruments from a JSON endpoint.
pub struct HttpSource {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpSource {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl UpstreamSource for HttpSource {
    async fn fetch_records(&self, segment: &Segment) -> Result<Vec<MarketRecord>, FetchError> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[("segment", segment.id.as_str())])
            .send()
            .await
            .map_err(|e| FetchError::ConnectionFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ConnectionFailure(format!(
                "{} returned HTTP {status}",
                self.endpoint
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::ConnectionFailure(e.to_string()))?;
        let envelope: Envelope = decode_payload(&body)?;
        debug!(
            segment = %segment.id,
            rows = envelope.data.len(),
            bytes = body.len(),
            "Decoded upstream payload"
        );

        let fetched_at = Utc::now();
        Ok(envelope
            .data
            .into_iter()
            .map(|row| row.normalize(segment, fetched_at))
            .collect())
    }
}
