use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Throughput figures after one batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub messages_per_sec: f64,
    pub percent_of_target: f64,
    /// Messages counted in the current window, this batch included.
    pub window_count: u64,
    pub total_processed: u64,
    pub total_throttled: u64,
}

/// Rolling-window throughput meter. Observational only.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    target_rate_per_sec: f64,
    window_start: Instant,
    window_count: u64,
    total_processed: u64,
    total_throttled: u64,
}

impl RateMeter {
    pub fn new(window: Duration, target_rate_per_sec: f64, now: Instant) -> Self {
        Self {
            window,
            target_rate_per_sec,
            window_start: now,
            window_count: 0,
            total_processed: 0,
            total_throttled: 0,
        }
    }

    /// Add one batch. A window that has run for at least its ceiling is
    /// restarted at `now` before the batch is counted.
    pub fn record_batch(&mut self, processed: u64, throttled: u64, now: Instant) -> RateSnapshot {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += processed;
        self.total_processed += processed;
        self.total_throttled += throttled;

        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        let messages_per_sec = if elapsed > 0.0 { self.window_count as f64 / elapsed } else { 0.0 };
        let percent_of_target = if self.target_rate_per_sec > 0.0 {
            messages_per_sec / self.target_rate_per_sec * 100.0
        } else {
            0.0
        };

        RateSnapshot {
            messages_per_sec,
            percent_of_target,
            window_count: self.window_count,
            total_processed: self.total_processed,
            total_throttled: self.total_throttled,
        }
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}
