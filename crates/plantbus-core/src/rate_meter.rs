//! Insert-Rate Meter (C11).
//!
//! In-memory bucketed sliding-window rate per client. Grounded on the
//! teacher's circuit breaker (`DashMap` keyed by name, `parking_lot`
//! serialization of the mutable counters per key) generalized from a single
//! boolean state machine to a small ordered bucket map per client.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;

const BUCKET_MS: i64 = 5_000;
const WINDOW_MS: i64 = 60_000;
const BUCKETS_IN_WINDOW: i64 = WINDOW_MS / BUCKET_MS;
const SCALE_TO_PER_MIN: i64 = WINDOW_MS / BUCKET_MS;

struct ClientBuckets {
    buckets: BTreeMap<i64, i64>,
}

impl ClientBuckets {
    fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    fn prune(&mut self, current_idx: i64) {
        let floor = current_idx - BUCKETS_IN_WINDOW + 1;
        self.buckets.retain(|&idx, _| idx >= floor);
    }
}

/// Per-client sliding-window insert-rate meter. One instance is shared
/// (via `Arc`) across every writer/reader in the process.
pub struct RateMeter {
    clients: DashMap<String, Mutex<ClientBuckets>>,
    now_ms: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            now_ms: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Test/seed hook: build a meter with an injected clock.
    #[cfg(test)]
    fn with_clock(now_ms: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            clients: DashMap::new(),
            now_ms: Box::new(now_ms),
        }
    }

    fn now_idx(&self) -> i64 {
        (self.now_ms)() / BUCKET_MS
    }

    /// Record `n` inserts for `client_id`. No-op if `client_id` is empty or
    /// `n <= 0`.
    pub fn record_inserts(&self, client_id: &str, n: i64) {
        if client_id.is_empty() || n <= 0 {
            return;
        }
        let idx = self.now_idx();
        let entry = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(ClientBuckets::new()));
        let mut buckets = entry.lock();
        *buckets.buckets.entry(idx).or_insert(0) += n;
        buckets.prune(idx);
    }

    /// Current inserts/min for a client: prune, then sum buckets in the
    /// window. Returns 0 for an unknown client.
    pub fn get_inserts_per_min(&self, client_id: &str) -> i64 {
        let idx = self.now_idx();
        match self.clients.get(client_id) {
            Some(entry) => {
                let mut buckets = entry.lock();
                buckets.prune(idx);
                buckets.buckets.values().sum()
            }
            None => 0,
        }
    }

    /// Last `points` buckets, oldest to newest, each scaled to an
    /// inserts-per-minute equivalent. Missing buckets are zero.
    pub fn get_inserts_series(&self, client_id: &str, points: i64) -> Vec<i64> {
        let idx = self.now_idx();
        let raw: BTreeMap<i64, i64> = match self.clients.get(client_id) {
            Some(entry) => {
                let mut buckets = entry.lock();
                buckets.prune(idx);
                buckets.buckets.clone()
            }
            None => BTreeMap::new(),
        };

        let start = idx - points + 1;
        (start..=idx)
            .map(|i| raw.get(&i).copied().unwrap_or(0) * SCALE_TO_PER_MIN)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn clocked(start_ms: i64) -> (RateMeter, Arc<AtomicI64>) {
        let clock = Arc::new(AtomicI64::new(start_ms));
        let clock_clone = Arc::clone(&clock);
        let meter = RateMeter::with_clock(move || clock_clone.load(Ordering::SeqCst));
        (meter, clock)
    }

    #[test]
    fn empty_client_id_or_nonpositive_count_is_a_no_op() {
        let (meter, _clock) = clocked(0);
        meter.record_inserts("", 5);
        meter.record_inserts("plant-A", 0);
        meter.record_inserts("plant-A", -3);
        assert_eq!(meter.get_inserts_per_min("plant-A"), 0);
    }

    #[test]
    fn per_min_sums_current_window_and_zeroes_after_expiry() {
        let (meter, clock) = clocked(0);
        meter.record_inserts("plant-A", 10);
        assert_eq!(meter.get_inserts_per_min("plant-A"), 10);

        // Still inside the 60s window.
        clock.store(30_000, Ordering::SeqCst);
        assert_eq!(meter.get_inserts_per_min("plant-A"), 10);

        // Past the window: every bucket has expired.
        clock.store(120_000, Ordering::SeqCst);
        assert_eq!(meter.get_inserts_per_min("plant-A"), 0);
    }

    #[test]
    fn scenario_s6_rate_series() {
        // t=0: 10 inserts, t=6s: 15, t=13s: 20. BUCKET_MS=5s, points=4,
        // query at t=14s.
        let (meter, clock) = clocked(0);
        meter.record_inserts("plant-A", 10);
        clock.store(6_000, Ordering::SeqCst);
        meter.record_inserts("plant-A", 15);
        clock.store(13_000, Ordering::SeqCst);
        meter.record_inserts("plant-A", 20);
        clock.store(14_000, Ordering::SeqCst);

        let series = meter.get_inserts_series("plant-A", 4);
        assert_eq!(series, vec![0, 120, 180, 240]);
        assert_eq!(meter.get_inserts_per_min("plant-A"), 45);
    }

    #[test]
    fn unknown_client_series_is_all_zero() {
        let (meter, _clock) = clocked(0);
        assert_eq!(meter.get_inserts_series("nope", 3), vec![0, 0, 0]);
    }
}
