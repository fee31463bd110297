// ===============================
// src/metrics.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : metrics.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Dua lapis metrik:
// - Prometheus statics di REGISTRY sendiri, diekspor sebagai teks ke
//   metrics.prom di akhir sesi (tidak ada HTTP listener).
// - LoopMetrics: rolling window per tick scheduler (latency, skip) untuk p95
//   dan skip rate, ditulis sebagai JSON line.
//
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::recorder::{atomic_write, PersistError};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Order flow --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "broker order transitions"), &["status"]).unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "fills by symbol & liquidity"), &["symbol", "liquidity"]).unwrap()
});

// source = risk | router | broker
pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rejects_total", "rejected intents (labels: source, reason)"), &["source", "reason"])
        .unwrap()
});

pub static BARS: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("bars_total", "bars processed"), &["symbol"]).unwrap());

// -------- Loop health --------
pub static LOOPS: Lazy<IntCounter> = Lazy::new(|| IntCounter::new("loops_total", "runner iterations").unwrap());

pub static SKIPS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("scheduler_skips_total", "cadence slots skipped after overrun").unwrap());

pub static HALTS: Lazy<IntCounterVec> =
    Lazy::new(|| IntCounterVec::new(Opts::new("halts_total", "session halts"), &["reason"]).unwrap());

// Strategy tick runtime (seconds)
pub static LOOP_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("strategy_tick_seconds", "strategy tick runtime (s)")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .unwrap()
});

// -------- Account --------
pub static EQUITY: Lazy<Gauge> = Lazy::new(|| Gauge::new("equity", "account equity").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> = Lazy::new(|| Gauge::new("pnl_realized", "realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> = Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL").unwrap());

pub static DRAWDOWN_BPS: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("drawdown_bps", "equity drawdown from peak (bps, <= 0)").unwrap());

static INIT: Lazy<()> = Lazy::new(|| {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(BARS.clone())),
        REGISTRY.register(Box::new(LOOPS.clone())),
        REGISTRY.register(Box::new(SKIPS.clone())),
        REGISTRY.register(Box::new(HALTS.clone())),
        REGISTRY.register(Box::new(LOOP_LATENCY.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(DRAWDOWN_BPS.clone())),
    ] {
        if let Err(e) = m {
            warn!(error = %e, "metric register failed");
        }
    }
});

/// Idempotent; safe to call from every session / test.
pub fn init() { Lazy::force(&INIT); }

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

pub fn export_to_file(path: &Path) -> Result<(), PersistError> {
    init();
    atomic_write(path, &encode_metrics())
}

// ---------------- LoopMetrics ----------------

#[derive(Debug, Clone, PartialEq)]
struct Tick {
    strategy: String,
    latency_s: f64,
    skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopMetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub ticks: usize,
    pub avg_latency_s: f64,
    pub p95_latency_s: f64,
    pub skip_rate: f64,
    pub queue_depth_max: usize,
    pub error_counts: BTreeMap<String, u64>,
    pub ticks_by_strategy: BTreeMap<String, usize>,
}

/// Rolling window of the last `window` strategy ticks.
#[derive(Debug, Clone)]
pub struct LoopMetrics {
    window: usize,
    ticks: VecDeque<Tick>,
    queue_depth_max: usize,
    error_counts: BTreeMap<String, u64>,
}

pub const DEFAULT_WINDOW: usize = 512;
const MIN_WINDOW: usize = 8;

impl Default for LoopMetrics {
    fn default() -> Self { Self::new(DEFAULT_WINDOW) }
}

impl LoopMetrics {
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_WINDOW);
        Self { window, ticks: VecDeque::with_capacity(window), queue_depth_max: 0, error_counts: BTreeMap::new() }
    }

    pub fn record_tick(&mut self, strategy: &str, latency_s: f64, skipped: bool) {
        if self.ticks.len() == self.window {
            self.ticks.pop_front();
        }
        self.ticks.push_back(Tick { strategy: strategy.to_string(), latency_s: latency_s.max(0.0), skipped });
        LOOP_LATENCY.observe(latency_s.max(0.0));
        if skipped {
            SKIPS.inc();
        }
    }

    pub fn record_queue_depth(&mut self, depth: usize) { self.queue_depth_max = self.queue_depth_max.max(depth); }

    pub fn record_error(&mut self, kind: &str) { *self.error_counts.entry(kind.to_string()).or_insert(0) += 1; }

    pub fn snapshot(&self, now: DateTime<Utc>) -> LoopMetricsSnapshot {
        let n = self.ticks.len();
        let mut lat: Vec<f64> = self.ticks.iter().map(|t| t.latency_s).collect();
        lat.sort_by(|a, b| a.total_cmp(b));
        let avg = if n == 0 { 0.0 } else { lat.iter().sum::<f64>() / n as f64 };
        let skips = self.ticks.iter().filter(|t| t.skipped).count();
        let mut by_strategy: BTreeMap<String, usize> = BTreeMap::new();
        for t in &self.ticks {
            *by_strategy.entry(t.strategy.clone()).or_insert(0) += 1;
        }
        LoopMetricsSnapshot {
            timestamp: now,
            ticks: n,
            avg_latency_s: avg,
            p95_latency_s: percentile(&lat, 0.95),
            skip_rate: if n == 0 { 0.0 } else { skips as f64 / n as f64 },
            queue_depth_max: self.queue_depth_max,
            error_counts: self.error_counts.clone(),
            ticks_by_strategy: by_strategy,
        }
    }
}

/// Linear interpolation between closest ranks. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[], 0.95), 0.0);
        assert_eq!(percentile(&[2.0], 0.95), 2.0);
        let v: Vec<f64> = (1..=11).map(|x| x as f64).collect();
        // rank = 0.95 * 10 = 9.5 -> between 10 and 11
        assert!((percentile(&v, 0.95) - 10.5).abs() < 1e-9);
        assert_eq!(percentile(&v, 0.0), 1.0);
    }

    #[test]
    fn window_is_bounded_and_skip_rate_counts() {
        let mut m = LoopMetrics::new(2); // bumped to the minimum of 8
        for i in 0..10 {
            m.record_tick("a", 0.01 * i as f64, i % 2 == 0);
        }
        m.record_queue_depth(3);
        m.record_queue_depth(1);
        m.record_error("feed_error");
        m.record_error("feed_error");

        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let snap = m.snapshot(ts);
        assert_eq!(snap.ticks, 8);
        assert_eq!(snap.skip_rate, 0.5);
        assert_eq!(snap.queue_depth_max, 3);
        assert_eq!(snap.error_counts.get("feed_error"), Some(&2));
        assert_eq!(snap.ticks_by_strategy.get("a"), Some(&8));
        assert!(snap.p95_latency_s <= 0.09 + 1e-9);
        assert!(snap.avg_latency_s > 0.0);
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snap = LoopMetrics::default().snapshot(Utc::now());
        assert_eq!(snap.ticks, 0);
        assert_eq!(snap.skip_rate, 0.0);
        assert_eq!(snap.p95_latency_s, 0.0);
    }

    #[test]
    fn export_writes_text_format() {
        init();
        init();
        ORDERS.with_label_values(&["placed"]).inc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        export_to_file(&path).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("orders_total"));
    }
}
