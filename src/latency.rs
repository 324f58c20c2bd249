use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

const WINDOW_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingSnapshot {
    pub price_tick: LatencyStats,
    pub anomaly_tick: LatencyStats,
    pub dispatch: LatencyStats,
    pub price_ticks: u64,
    pub anomaly_ticks: u64,
    pub failed_ticks: u64,
}

/// Rolling wall-clock durations of polling iterations and alert dispatches.
#[derive(Debug, Default)]
pub struct TickTimings {
    price: VecDeque<u64>,
    anomaly: VecDeque<u64>,
    dispatch: VecDeque<u64>,
    price_ticks: u64,
    anomaly_ticks: u64,
    failed_ticks: u64,
}

impl TickTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_price_tick(&mut self, elapsed: Duration, ok: bool) {
        self.price_ticks += 1;
        if !ok {
            self.failed_ticks += 1;
        }
        push_capped(&mut self.price, micros(elapsed));
    }

    pub fn record_anomaly_tick(&mut self, elapsed: Duration, ok: bool) {
        self.anomaly_ticks += 1;
        if !ok {
            self.failed_ticks += 1;
        }
        push_capped(&mut self.anomaly, micros(elapsed));
    }

    pub fn record_dispatch(&mut self, elapsed: Duration) {
        push_capped(&mut self.dispatch, micros(elapsed));
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            price_tick: compute_stats(&self.price),
            anomaly_tick: compute_stats(&self.anomaly),
            dispatch: compute_stats(&self.dispatch),
            price_ticks: self.price_ticks,
            anomaly_ticks: self.anomaly_ticks,
            failed_ticks: self.failed_ticks,
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn push_capped(q: &mut VecDeque<u64>, val: u64) {
    if q.len() >= WINDOW_SIZE {
        q.pop_front();
    }
    q.push_back(val);
}

fn compute_stats(q: &VecDeque<u64>) -> LatencyStats {
    if q.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted: Vec<u64> = q.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();
    LatencyStats {
        p50_us: sorted[n * 50 / 100],
        p95_us: sorted[n * 95 / 100],
        p99_us: sorted[(n * 99 / 100).min(n - 1)],
        min_us: sorted[0],
        max_us: sorted[n - 1],
        count: n,
    }
}
