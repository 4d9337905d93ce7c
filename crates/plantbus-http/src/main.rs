//! Multi-DB HTTP read surface.
//!
//! Raw hyper server (no framework) exposing the two external read
//! endpoints: per-client alert summaries and filtered alert history,
//! fanned out across every configured area database.
//!
//! Grounded on the health check server's accept-loop-plus-service_fn
//! shape; generalized from a fixed route table to path/query parsing
//! against the alert fan-out core.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use plantbus_core::alerts::{get_alerts_from_all_areas, summarize_from_all_areas, AlertQuery};
use plantbus_core::area::AreaRegistry;
use plantbus_core::config::{area_db_targets_from_env, env_var_or, env_var_parse_or, AreaDbTarget};
use plantbus_core::error::CoreError;
use tokio::net::TcpListener;
use tracing::{error, info};

struct AppState {
    targets: Vec<AreaDbTarget>,
    registry: AreaRegistry,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let sites_raw = env_var_or("RABBITMQ_SITES", "");
    let sites: Vec<String> = sites_raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let registry = AreaRegistry::new(&sites, AreaRegistry::default_aliases());
    let slugs: Vec<String> = registry.areas().iter().map(|a| a.slug.clone()).collect();
    let targets = area_db_targets_from_env(&slugs);

    info!(areas = targets.len(), "starting HTTP read surface");

    let state = Arc::new(AppState { targets, registry });
    let port: u16 = env_var_parse_or("HTTP_PORT", 8080);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to accept connection");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle_request(req, state).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                if !err.is_incomplete_message() {
                    error!(error = %err, "connection error");
                }
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, [client_id, "alerts-summary"]) => {
            summary_response(&state, client_id).await
        }
        (&Method::GET, [client_id, "alerts-sent"]) => {
            sent_response(&state, client_id, &query).await
        }
        _ => not_found(),
    };

    Ok(response)
}

async fn summary_response(state: &AppState, client_id: &str) -> Response<Full<Bytes>> {
    if let Err(err) = validate_client_id(client_id) {
        return error_response_for(&err);
    }
    let summary = summarize_from_all_areas(&state.targets, client_id).await;
    json_response(StatusCode::OK, &summary)
}

async fn sent_response(
    state: &AppState,
    client_id: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if let Err(err) = validate_client_id(client_id) {
        return error_response_for(&err);
    }

    let (start_date, end_date) = match resolve_window(query) {
        Ok(window) => window,
        Err(err) => return error_response_for(&err),
    };

    let alert_query = AlertQuery {
        client_id: client_id.to_string(),
        site: query.get("site").cloned(),
        tag_name: query.get("tagName").cloned(),
        start_date: Some(start_date),
        end_date: Some(end_date),
        limit: query.get("limit").and_then(|v| v.parse().ok()),
    };

    let alerts = get_alerts_from_all_areas(&state.targets, &state.registry, &alert_query).await;
    json_response(StatusCode::OK, &alerts)
}

fn validate_client_id(client_id: &str) -> Result<(), CoreError> {
    if client_id.trim().is_empty() {
        return Err(CoreError::Validation("clientId must not be empty".into()));
    }
    Ok(())
}

/// Resolve the `[startDate, endDate]` window from `startYear…`/`endYear…`
/// integer date parts plus `tzOffsetMinutes`. Either side may be absent;
/// an entirely absent window defaults to the last hour ending now, and a
/// one-sided window fills the other side from it.
fn resolve_window(query: &HashMap<String, String>) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let tz_offset_minutes: i32 = match query.get("tzOffsetMinutes") {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Validation(format!("tzOffsetMinutes '{raw}' is not an integer")))?,
        None => 0,
    };
    if !(-840..=840).contains(&tz_offset_minutes) {
        return Err(CoreError::Validation(format!(
            "tzOffsetMinutes {tz_offset_minutes} out of range [-840, 840]"
        )));
    }

    let start = compose_instant(query, "start", tz_offset_minutes)?;
    let end = compose_instant(query, "end", tz_offset_minutes)?;

    let now = Utc::now();
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (Some(start), None) => (start, now),
        (None, Some(end)) => (end - Duration::hours(1), end),
        (None, None) => (now - Duration::hours(1), now),
    };

    if start > end {
        return Err(CoreError::Validation("startDate must not be after endDate".into()));
    }

    Ok((start, end))
}

/// Compose a UTC instant from `{prefix}Year`/`Month`/`Day`/`Hour`/`Minute`/
/// `Second` query parts and a caller-supplied timezone offset. Returns
/// `Ok(None)` when the date parts are entirely absent. `NaiveDate`'s own
/// validation rejects non-existent calendar days (e.g. Feb 30) and
/// out-of-range time parts.
fn compose_instant(
    query: &HashMap<String, String>,
    prefix: &str,
    tz_offset_minutes: i32,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    let year_key = format!("{prefix}Year");
    let Some(year_raw) = query.get(&year_key) else {
        return Ok(None);
    };
    let month_key = format!("{prefix}Month");
    let day_key = format!("{prefix}Day");

    let parse_part = |key: &str, raw: Option<&String>, default: u32| -> Result<u32, CoreError> {
        match raw {
            Some(v) => v
                .parse()
                .map_err(|_| CoreError::Validation(format!("{key} '{v}' is not an integer"))),
            None => Ok(default),
        }
    };

    let year: i32 = year_raw
        .parse()
        .map_err(|_| CoreError::Validation(format!("{year_key} '{year_raw}' is not an integer")))?;
    let month = parse_part(&month_key, query.get(&month_key), 1)?;
    let day = parse_part(&day_key, query.get(&day_key), 1)?;
    let hour = parse_part(&format!("{prefix}Hour"), query.get(&format!("{prefix}Hour")), 0)?;
    let minute = parse_part(&format!("{prefix}Minute"), query.get(&format!("{prefix}Minute")), 0)?;
    let second = parse_part(&format!("{prefix}Second"), query.get(&format!("{prefix}Second")), 0)?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| CoreError::Validation(format!("{prefix} date {year}-{month}-{day} does not exist")))?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| CoreError::Validation(format!("{prefix} time {hour}:{minute}:{second} is invalid")))?;
    let naive = NaiveDateTime::new(date, time);

    let offset = FixedOffset::east_opt(tz_offset_minutes * 60)
        .ok_or_else(|| CoreError::Validation(format!("tzOffsetMinutes {tz_offset_minutes} out of range")))?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| CoreError::Validation(format!("{prefix} date/time does not resolve to a unique instant")))?;

    Ok(Some(local.with_timezone(&Utc)))
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((
                urlencoding_decode(key),
                urlencoding_decode(value),
            ))
        })
        .collect()
}

/// Minimal `application/x-www-form-urlencoded` percent-decoding for query
/// values; the read surface only needs ASCII identifiers and ISO-8601
/// timestamps, never full Unicode form bodies.
fn urlencoding_decode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(_) => error_response(),
    }
}

fn error_response_for(err: &CoreError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &err.to_body())
}

fn error_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::new(Bytes::from_static(b"{\"error\":\"serialization failed\"}")))
        .unwrap()
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"Not Found")))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_percent_and_plus() {
        let parsed = parse_query("tagName=TEMP%2001&site=Linha+A");
        assert_eq!(parsed.get("tagName").unwrap(), "TEMP 01");
        assert_eq!(parsed.get("site").unwrap(), "Linha A");
    }

    #[test]
    fn empty_query_parses_to_empty_map() {
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn empty_client_id_fails_validation() {
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("   ").is_err());
        assert!(validate_client_id("plant-A").is_ok());
    }

    #[test]
    fn absent_window_defaults_to_last_hour() {
        let (start, end) = resolve_window(&HashMap::new()).unwrap();
        let span = end - start;
        assert_eq!(span, Duration::hours(1));
    }

    #[test]
    fn one_sided_start_window_fills_end_with_now() {
        let mut query = HashMap::new();
        query.insert("startYear".into(), "2025".into());
        query.insert("startMonth".into(), "1".into());
        query.insert("startDay".into(), "15".into());
        let (start, end) = resolve_window(&query).unwrap();
        assert!(start.to_rfc3339().starts_with("2025-01-15"));
        assert!(end > start);
    }

    #[test]
    fn start_after_end_fails_validation() {
        let mut query = HashMap::new();
        query.insert("startYear".into(), "2025".into());
        query.insert("startMonth".into(), "2".into());
        query.insert("startDay".into(), "1".into());
        query.insert("endYear".into(), "2025".into());
        query.insert("endMonth".into(), "1".into());
        query.insert("endDay".into(), "1".into());
        assert!(resolve_window(&query).is_err());
    }

    #[test]
    fn tz_offset_out_of_range_fails_validation() {
        let mut query = HashMap::new();
        query.insert("tzOffsetMinutes".into(), "900".into());
        assert!(resolve_window(&query).is_err());
        let mut query = HashMap::new();
        query.insert("tzOffsetMinutes".into(), "-900".into());
        assert!(resolve_window(&query).is_err());
    }

    #[test]
    fn tz_offset_boundary_values_are_accepted() {
        let mut query = HashMap::new();
        query.insert("tzOffsetMinutes".into(), "840".into());
        assert!(resolve_window(&query).is_ok());
        let mut query = HashMap::new();
        query.insert("tzOffsetMinutes".into(), "-840".into());
        assert!(resolve_window(&query).is_ok());
    }

    #[test]
    fn non_existent_calendar_day_fails_validation() {
        let mut query = HashMap::new();
        query.insert("startYear".into(), "2025".into());
        query.insert("startMonth".into(), "2".into());
        query.insert("startDay".into(), "30".into());
        assert!(resolve_window(&query).is_err());
    }

    #[test]
    fn tz_offset_shifts_composed_instant() {
        let mut query = HashMap::new();
        query.insert("startYear".into(), "2025".into());
        query.insert("startMonth".into(), "1".into());
        query.insert("startDay".into(), "15".into());
        query.insert("startHour".into(), "10".into());
        query.insert("tzOffsetMinutes".into(), "180".into());
        let composed = compose_instant(&query, "start", 180).unwrap().unwrap();
        // Local 10:00 at UTC+3 is 07:00 UTC.
        assert_eq!(composed.format("%H:%M").to_string(), "07:00");
    }
}
