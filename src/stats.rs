//! Delivery and request statistics.
//!
//! Each component owns its counters behind its own lock; callers only ever
//! receive cloned snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_latency(name: &'static str, latency: Duration) {
    metrics::histogram!(name, latency.as_secs_f64() * 1_000.0);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_latency(_name: &'static str, _latency: Duration) {}

/// `(avg * (n - 1) + sample) / n`, where `n` counts the new sample.
pub(crate) fn rolling_average(average: f64, n: u64, sample_ms: f64) -> f64 {
    if n <= 1 {
        return sample_ms;
    }
    let n = n as f64;
    (average * (n - 1.0) + sample_ms) / n
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Outbound delivery counters. One delivery is one whole attempt set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStats {
    pub deliveries_total: u64,
    pub deliveries_success: u64,
    pub deliveries_failed: u64,
    pub average_latency_ms: f64,
    pub last_delivery_time: Option<DateTime<Utc>>,
}

impl ClientStats {
    pub(crate) fn record(&mut self, success: bool, latency: Duration) {
        self.deliveries_total += 1;
        if success {
            self.deliveries_success += 1;
        } else {
            self.deliveries_failed += 1;
        }
        self.average_latency_ms = rolling_average(
            self.average_latency_ms,
            self.deliveries_total,
            as_millis_f64(latency),
        );
        self.last_delivery_time = Some(Utc::now());
    }
}

/// Inbound request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    /// Handlers currently executing.
    pub active_handlers: u64,
    pub average_latency_ms: f64,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl ServerStats {
    pub(crate) fn begin(&mut self) {
        self.requests_total += 1;
        self.active_handlers += 1;
        self.last_request_time = Some(Utc::now());
    }

    /// Close out a request started with [`begin`](Self::begin).
    pub(crate) fn finish(&mut self, status: u16, latency: Duration) {
        self.active_handlers = self.active_handlers.saturating_sub(1);
        if (200..300).contains(&status) {
            self.requests_success += 1;
        } else {
            self.requests_error += 1;
        }
        let completed = self.requests_success + self.requests_error;
        self.average_latency_ms =
            rolling_average(self.average_latency_ms, completed, as_millis_f64(latency));
    }
}
