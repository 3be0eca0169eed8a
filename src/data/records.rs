//! PostgreSQL-backed [`RecordStore`] for the `market_records` and
//! `refresh_cycles` tables.

use crate::data::persistence::RecordStore;
use crate::market::MarketRecord;
use crate::refresh::RefreshCycle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of persisted instrument rows.
    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM market_records")
            .fetch_one(&self.pool)
            .await
            .context("failed to count market records")
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_records(&self, records: &[MarketRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let segments: Vec<&str> = records.iter().map(|r| r.segment.as_str()).collect();
        let codes: Vec<&str> = records.iter().map(|r| r.code.as_str()).collect();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let class_codes: Vec<&str> = records
            .iter()
            .map(|r| r.classification_code.as_str())
            .collect();
        let class_names: Vec<&str> = records
            .iter()
            .map(|r| r.classification_name.as_str())
            .collect();
        let total_values: Vec<f64> = records.iter().map(|r| r.total_value).collect();
        let daily_inflows: Vec<f64> = records.iter().map(|r| r.daily_net_inflow).collect();
        let ratios: Vec<f64> = records.iter().map(|r| r.net_inflow_ratio).collect();
        let weekly_inflows: Vec<f64> = records.iter().map(|r| r.latest_7d_inflow).collect();
        let volatilities: Vec<f64> = records.iter().map(|r| r.recent_volatility).collect();
        let statuses: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();
        let provenances: Vec<&str> = records.iter().map(|r| r.provenance.as_str()).collect();
        let updated: Vec<DateTime<Utc>> = records.iter().map(|r| r.last_updated).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO market_records (
                segment, code, name, classification_code, classification_name,
                total_value, daily_net_inflow, net_inflow_ratio, latest_7d_inflow,
                recent_volatility, status, provenance, last_updated
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                $6::float8[], $7::float8[], $8::float8[], $9::float8[],
                $10::float8[], $11::text[], $12::text[], $13::timestamptz[]
            )
            ON CONFLICT (segment, code) DO UPDATE SET
                name = EXCLUDED.name,
                classification_code = EXCLUDED.classification_code,
                classification_name = EXCLUDED.classification_name,
                total_value = EXCLUDED.total_value,
                daily_net_inflow = EXCLUDED.daily_net_inflow,
                net_inflow_ratio = EXCLUDED.net_inflow_ratio,
                latest_7d_inflow = EXCLUDED.latest_7d_inflow,
                recent_volatility = EXCLUDED.recent_volatility,
                status = EXCLUDED.status,
                provenance = EXCLUDED.provenance,
                last_updated = EXCLUDED.last_updated,
                persisted_at = now()
            "#,
        )
        .bind(&segments)
        .bind(&codes)
        .bind(&names)
        .bind(&class_codes)
        .bind(&class_names)
        .bind(&total_values)
        .bind(&daily_inflows)
        .bind(&ratios)
        .bind(&weekly_inflows)
        .bind(&volatilities)
        .bind(&statuses)
        .bind(&provenances)
        .bind(&updated)
        .execute(&self.pool)
        .await
        .context("failed to batch upsert market records")?;

        Ok(result.rows_affected())
    }

    async fn record_cycle(&self, cycle: &RefreshCycle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_cycles (
                id, trigger, generation, started_at, completed_at, total_records,
                live_segments, fallback_segments, timeout_segments, segments
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (started_at, id) DO NOTHING
            "#,
        )
        .bind(i64::try_from(cycle.id).unwrap_or(i64::MAX))
        .bind(cycle.trigger.as_str())
        .bind(i64::try_from(cycle.generation).unwrap_or(i64::MAX))
        .bind(cycle.started_at)
        .bind(cycle.completed_at)
        .bind(i32::try_from(cycle.total_records).unwrap_or(i32::MAX))
        .bind(i32::try_from(cycle.success_count()).unwrap_or(i32::MAX))
        .bind(i32::try_from(cycle.fallback_count()).unwrap_or(i32::MAX))
        .bind(i32::try_from(cycle.timeout_count()).unwrap_or(i32::MAX))
        .bind(Json(&cycle.segments))
        .execute(&self.pool)
        .await
        .context("failed to insert refresh cycle")?;

        Ok(())
    }
}
