//! Alert Persistence Core (C7).
//!
//! One `AlertStore` per area database. Schema is created idempotently on
//! first use and the "ensured" flag is cached so later calls skip the DDL
//! round-trip.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::envelope::{AlertPayload, AlertSample, AlertSummary, DeviationLevel};
use crate::error::CoreError;

/// Filters accepted by [`AlertStore::find_by_filters`]. All present fields
/// are AND-combined; string filters match exactly after trim.
#[derive(Debug, Clone, Default)]
pub struct AlertFilters {
    pub client_id: String,
    pub limit: Option<i64>,
    pub tag_name: Option<String>,
    pub site: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl AlertFilters {
    /// Limit clamped to `[1, 500]`; absent or zero defaults to 100.
    fn clamped_limit(&self) -> i64 {
        match self.limit {
            None | Some(0) => 100,
            Some(n) => n.clamp(1, 500),
        }
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: Uuid,
    client_id: String,
    site: Option<String>,
    timestamp: DateTime<Utc>,
    tag_name: String,
    value: f64,
    desvio: String,
    alerts_count: i64,
    unidade: String,
    recipients: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<AlertRow> for AlertSample {
    fn from(row: AlertRow) -> Self {
        AlertSample {
            id: row.id,
            client_id: row.client_id,
            site: row.site,
            timestamp: row.timestamp,
            tag_name: row.tag_name,
            value: row.value,
            desvio: DeviationLevel::parse_lenient(&row.desvio),
            alerts_count: row.alerts_count,
            unidade: row.unidade,
            recipients: serde_json::from_value(row.recipients).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

pub struct AlertStore {
    pool: PgPool,
    schema_ensured: AtomicBool,
}

impl AlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ensured: AtomicBool::new(false),
        }
    }

    async fn ensure_schema(&self) -> Result<(), CoreError> {
        if self.schema_ensured.load(Ordering::Relaxed) {
            return Ok(());
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id UUID PRIMARY KEY,
                client_id TEXT NOT NULL,
                site TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                tag_name TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                desvio TEXT NOT NULL,
                alerts_count BIGINT NOT NULL,
                unidade TEXT NOT NULL,
                recipients JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS alerts_client_timestamp_idx ON alerts (client_id, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS alerts_client_tag_desvio_timestamp_idx ON alerts (client_id, tag_name, desvio, timestamp DESC)",
        )
        .execute(&self.pool)
        .await?;

        self.schema_ensured.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically insert unless a row with the same `(client_id, site,
    /// tag_name, desvio)` already exists within `[ts - dedup_window_ms, ts]`.
    /// Returns the inserted row, or `None` if suppressed as a duplicate.
    pub async fn insert_if_not_recent(
        &self,
        payload: &AlertPayload,
        dedup_window_ms: i64,
    ) -> Result<Option<AlertSample>, CoreError> {
        self.ensure_schema().await?;

        let id = Uuid::new_v4();
        let window_start = payload.ts - chrono::Duration::milliseconds(dedup_window_ms);
        let recipients = serde_json::to_value(&payload.recipients)
            .map_err(|e| CoreError::Validation(format!("recipients serialize: {e}")))?;

        let row = sqlx::query_as::<_, AlertRow>(
            r#"
            INSERT INTO alerts (id, client_id, site, timestamp, tag_name, value, desvio, alerts_count, unidade, recipients, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now()
            WHERE NOT EXISTS (
                SELECT 1 FROM alerts
                WHERE client_id = $2
                  AND tag_name = $5
                  AND desvio = $7
                  AND COALESCE(site, '') = COALESCE($3, '')
                  AND timestamp BETWEEN $11 AND $4
            )
            RETURNING id, client_id, site, timestamp, tag_name, value, desvio, alerts_count, unidade, recipients, created_at
            "#,
        )
        .bind(id)
        .bind(&payload.client_id)
        .bind(&payload.site)
        .bind(payload.ts)
        .bind(&payload.tag_name)
        .bind(payload.value)
        .bind(payload.desvio.as_str())
        .bind(payload.alerts_count)
        .bind(&payload.unidade)
        .bind(recipients)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AlertSample::from))
    }

    /// Filters are AND-combined, results sorted by timestamp descending.
    pub async fn find_by_filters(&self, filters: &AlertFilters) -> Result<Vec<AlertSample>, CoreError> {
        self.ensure_schema().await?;

        let mut sql = String::from(
            "SELECT id, client_id, site, timestamp, tag_name, value, desvio, alerts_count, unidade, recipients, created_at FROM alerts WHERE client_id = $1",
        );
        let mut idx = 2;

        if filters.tag_name.is_some() {
            sql.push_str(&format!(" AND tag_name = ${idx}"));
            idx += 1;
        }
        if filters.site.is_some() {
            sql.push_str(&format!(" AND site = ${idx}"));
            idx += 1;
        }
        if filters.start_date.is_some() {
            sql.push_str(&format!(" AND timestamp >= ${idx}"));
            idx += 1;
        }
        if filters.end_date.is_some() {
            sql.push_str(&format!(" AND timestamp <= ${idx}"));
            idx += 1;
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT $");
        sql.push_str(&idx.to_string());

        let mut query = sqlx::query_as::<_, AlertRow>(&sql).bind(filters.client_id.trim());
        if let Some(tag) = &filters.tag_name {
            query = query.bind(tag.trim().to_string());
        }
        if let Some(site) = &filters.site {
            query = query.bind(site.trim().to_string());
        }
        if let Some(start) = filters.start_date {
            query = query.bind(start);
        }
        if let Some(end) = filters.end_date {
            query = query.bind(end);
        }
        query = query.bind(filters.clamped_limit());

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(AlertSample::from).collect())
    }

    /// Three aggregates over a client's alert history.
    pub async fn summarize_by_client(&self, client_id: &str) -> Result<AlertSummary, CoreError> {
        self.ensure_schema().await?;

        let total: i64 = sqlx::query("SELECT count(*) AS c FROM alerts WHERE client_id = $1")
            .bind(client_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;

        let last_timestamp: Option<DateTime<Utc>> =
            sqlx::query("SELECT max(timestamp) AS m FROM alerts WHERE client_id = $1")
                .bind(client_id)
                .fetch_one(&self.pool)
                .await?
                .try_get("m")?;

        let level_rows = sqlx::query(
            "SELECT desvio, count(*) AS c FROM alerts WHERE client_id = $1 GROUP BY desvio",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        let mut by_level = std::collections::HashMap::new();
        for row in level_rows {
            let desvio: String = row.try_get("desvio")?;
            let count: i64 = row.try_get("c")?;
            let key = DeviationLevel::parse_lenient(&desvio).as_str().to_string();
            by_level.insert(key, count);
        }

        let tag_rows = sqlx::query(
            "SELECT tag_name, count(*) AS c FROM alerts WHERE client_id = $1 GROUP BY tag_name",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        let mut by_tag = std::collections::HashMap::new();
        for row in tag_rows {
            let tag_name: Option<String> = row.try_get("tag_name")?;
            let count: i64 = row.try_get("c")?;
            let key = tag_name
                .map(|t| if t.trim().is_empty() { "(sem tag)".to_string() } else { t })
                .unwrap_or_else(|| "(sem tag)".to_string());
            by_tag.insert(key, count);
        }

        Ok(AlertSummary {
            client_id: client_id.to_string(),
            total,
            by_level,
            by_tag,
            last_timestamp: last_timestamp.map(|ts| ts.to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_to_one_through_five_hundred() {
        let mut filters = AlertFilters {
            client_id: "plant-A".into(),
            ..Default::default()
        };
        filters.limit = Some(0);
        assert_eq!(filters.clamped_limit(), 100);
        filters.limit = Some(10_000);
        assert_eq!(filters.clamped_limit(), 500);
        filters.limit = None;
        assert_eq!(filters.clamped_limit(), 100);
        filters.limit = Some(1);
        assert_eq!(filters.clamped_limit(), 1);
    }
}
