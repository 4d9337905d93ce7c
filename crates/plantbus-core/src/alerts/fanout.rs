//! Multi-DB Read Fan-Out (C10).
//!
//! Queries every configured area database in parallel, tolerates a
//! missing-table area (schema not yet provisioned) by treating it as
//! empty, and merges results into one timestamp-descending, limit-truncated
//! list.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use std::collections::HashMap;

use crate::alerts::persistence::AlertStore;
use crate::area::AreaRegistry;
use crate::config::AreaDbTarget;
use crate::envelope::{AlertSample, AlertSummary};
use crate::error::CoreError;

#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub client_id: String,
    pub site: Option<String>,
    pub tag_name: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AlertQuery {
    fn clamped_limit(&self) -> i64 {
        match self.limit {
            None | Some(0) => 100,
            Some(n) => n.clamp(1, 500),
        }
    }
}

/// Resolve targets (single area if `query.site` is given, else all), query
/// each in parallel, merge, sort by timestamp descending, and truncate.
pub async fn get_alerts_from_all_areas(
    targets: &[AreaDbTarget],
    registry: &AreaRegistry,
    query: &AlertQuery,
) -> Vec<AlertSample> {
    let selected: Vec<&AreaDbTarget> = match &query.site {
        Some(site) => {
            let area = registry.resolve_area_by_site(site);
            targets.iter().filter(|t| t.slug == area.slug).collect()
        }
        None => targets.iter().collect(),
    };

    let futures = selected
        .into_iter()
        .map(|target| query_one_area(target, query));
    let results = futures::future::join_all(futures).await;

    let mut merged: Vec<AlertSample> = results.into_iter().flatten().collect();
    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged.truncate(query.clamped_limit() as usize);
    merged
}

/// Merge `summarize_by_client` across every configured area database,
/// summing totals/by-level/by-tag counts and keeping the latest
/// `lastTimestamp`. Unreachable or unprovisioned areas contribute zero.
pub async fn summarize_from_all_areas(targets: &[AreaDbTarget], client_id: &str) -> AlertSummary {
    let futures = targets.iter().map(|target| summarize_one_area(target, client_id));
    let results = futures::future::join_all(futures).await;

    let mut merged = AlertSummary {
        client_id: client_id.to_string(),
        total: 0,
        by_level: HashMap::new(),
        by_tag: HashMap::new(),
        last_timestamp: None,
    };

    for summary in results.into_iter().flatten() {
        merged.total += summary.total;
        for (level, count) in summary.by_level {
            *merged.by_level.entry(level).or_insert(0) += count;
        }
        for (tag, count) in summary.by_tag {
            *merged.by_tag.entry(tag).or_insert(0) += count;
        }
        merged.last_timestamp = match (&merged.last_timestamp, &summary.last_timestamp) {
            (None, other) => other.clone(),
            (Some(current), Some(candidate)) if candidate > current => Some(candidate.clone()),
            (current, _) => current.clone(),
        };
    }

    merged
}

async fn summarize_one_area(target: &AreaDbTarget, client_id: &str) -> Option<AlertSummary> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&target.connection_string())
        .await
        .ok()?;
    let store = AlertStore::new(pool.clone());
    let result = store.summarize_by_client(client_id).await;
    pool.close().await;
    match result {
        Ok(summary) => Some(summary),
        Err(err) => {
            warn!(area = %target.slug, error = %err, "area summarize failed");
            None
        }
    }
}

async fn query_one_area(target: &AreaDbTarget, query: &AlertQuery) -> Vec<AlertSample> {
    let pool = match PgPoolOptions::new()
        .max_connections(1)
        .connect(&target.connection_string())
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            warn!(area = %target.slug, host = %target.host, port = target.port, database = %target.database, error = %err, "failed to connect to area database");
            return Vec::new();
        }
    };

    let result = run_query(&pool, target, query).await;
    pool.close().await;

    match result {
        Ok(samples) => samples,
        Err(CoreError::NotFound(_)) => {
            info!(area = %target.slug, "alerts table not provisioned yet, treating area as empty");
            Vec::new()
        }
        Err(err) => {
            warn!(area = %target.slug, host = %target.host, port = target.port, database = %target.database, error = %err, "area query failed");
            Vec::new()
        }
    }
}

async fn run_query(
    pool: &sqlx::PgPool,
    _target: &AreaDbTarget,
    query: &AlertQuery,
) -> Result<Vec<AlertSample>, CoreError> {
    use crate::alerts::persistence::AlertFilters;

    let store = AlertStore::new(pool.clone());
    let filters = AlertFilters {
        client_id: query.client_id.clone(),
        limit: query.limit,
        tag_name: query.tag_name.clone(),
        site: query.site.clone(),
        start_date: query.start_date,
        end_date: query.end_date,
    };
    store.find_by_filters(&filters).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_limit_clamps_to_one_through_five_hundred() {
        let mut query = AlertQuery {
            client_id: "plant-A".into(),
            ..Default::default()
        };
        query.limit = Some(-5);
        assert_eq!(query.clamped_limit(), 1);
        query.limit = Some(900);
        assert_eq!(query.clamped_limit(), 500);
    }

    #[test]
    fn merge_sorts_descending_and_truncates() {
        fn sample(ts_secs: i64) -> AlertSample {
            AlertSample {
                id: uuid::Uuid::new_v4(),
                client_id: "plant-A".into(),
                site: None,
                timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
                tag_name: "T".into(),
                value: 1.0,
                desvio: crate::envelope::DeviationLevel::Low,
                alerts_count: 1,
                unidade: "C".into(),
                recipients: vec![],
                created_at: Utc::now(),
            }
        }
        let mut merged = vec![sample(10), sample(30), sample(20)];
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        merged.truncate(2);
        assert_eq!(merged[0].timestamp, DateTime::from_timestamp(30, 0).unwrap());
        assert_eq!(merged[1].timestamp, DateTime::from_timestamp(20, 0).unwrap());
    }
}
