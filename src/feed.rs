// ===============================
// src/feed.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : feed.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Market data adapters (bar OHLCV):
// - MemoryFeed : bar disiapkan di memori (untuk test / replay)
// - CsvFeed    : tail file CSV (ts,open,high,low,close,volume[,symbol])
// - MockFeed   : random walk deterministik (seeded), bar baru tiap interval
//
// Kontrak: fetch_bars mengembalikan bar dengan ts > since, urut naik.
//
use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, DurationRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::clock::SharedClock;
use crate::domain::Bar;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("bad interval '{0}'")]
    BadInterval(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

pub trait DataFeed: Send {
    fn fetch_bars(&mut self, symbol: &str, interval: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Bar>, FetchError>;
}

/// "30s", "1m", "15m", "1h", "1d".
pub fn parse_interval(interval: &str) -> Result<Duration, FetchError> {
    let s = interval.trim();
    let bad = || FetchError::BadInterval(interval.to_string());
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(bad)?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num.parse().map_err(|_| bad())?;
    if n <= 0 {
        return Err(bad());
    }
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" | "min" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(bad()),
    }
}

fn after(bars: impl IntoIterator<Item = Bar>, since: Option<DateTime<Utc>>) -> Vec<Bar> {
    let mut out: Vec<Bar> = bars.into_iter().filter(|b| since.map(|s| b.ts > s).unwrap_or(true)).collect();
    out.sort_by_key(|b| b.ts);
    out
}

// ---------------- MemoryFeed ----------------

#[derive(Debug, Default)]
pub struct MemoryFeed {
    bars: BTreeMap<String, Vec<Bar>>,
    fail_with: Option<String>,
}

impl MemoryFeed {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, bar: Bar) { self.bars.entry(bar.symbol.clone()).or_default().push(bar); }

    pub fn extend<I: IntoIterator<Item = Bar>>(&mut self, bars: I) {
        for b in bars {
            self.push(b);
        }
    }

    /// Every fetch fails until cleared.
    pub fn fail_with(&mut self, msg: Option<String>) { self.fail_with = msg; }
}

impl DataFeed for MemoryFeed {
    fn fetch_bars(&mut self, symbol: &str, _interval: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Bar>, FetchError> {
        if let Some(msg) = &self.fail_with {
            return Err(FetchError::Unavailable(msg.clone()));
        }
        let bars = self.bars.get(symbol).cloned().unwrap_or_default();
        Ok(after(bars, since))
    }
}

// ---------------- CsvFeed ----------------

#[derive(Debug, Deserialize)]
struct CsvBar {
    ts: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    #[serde(default)]
    symbol: Option<String>,
}

/// Re-reads the file each fetch, so rows appended by another process show up.
#[derive(Debug, Clone)]
pub struct CsvFeed {
    path: PathBuf,
}

impl CsvFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

impl DataFeed for CsvFeed {
    fn fetch_bars(&mut self, symbol: &str, _interval: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Bar>, FetchError> {
        let file = std::fs::File::open(&self.path)
            .map_err(|source| FetchError::Io { path: self.path.display().to_string(), source })?;
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
        let mut bars = Vec::new();
        for row in rdr.deserialize::<CsvBar>() {
            let row = row?;
            if row.symbol.as_deref().map(|s| s != symbol).unwrap_or(false) {
                continue;
            }
            bars.push(Bar {
                ts: row.ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                symbol: symbol.to_string(),
            });
        }
        let out = after(bars, since);
        debug!(path = %self.path.display(), %symbol, n = out.len(), "csv bars read");
        Ok(out)
    }
}

// ---------------- MockFeed ----------------

/// Random walk in bps steps. Emits every closed bar between `since` and the
/// clock's now, capped at `max_batch` per call.
pub struct MockFeed {
    clock: SharedClock,
    rng: StdRng,
    last_close: BTreeMap<String, Decimal>,
    start_price: Decimal,
    max_batch: usize,
}

impl MockFeed {
    pub fn new(clock: SharedClock, seed: u64) -> Self {
        Self {
            clock,
            rng: StdRng::seed_from_u64(seed),
            last_close: BTreeMap::new(),
            start_price: dec!(100),
            max_batch: 500,
        }
    }

    pub fn with_start_price(mut self, price: Decimal) -> Self {
        self.start_price = price;
        self
    }

    fn next_bar(&mut self, symbol: &str, ts: DateTime<Utc>) -> Bar {
        let open = self.last_close.get(symbol).copied().unwrap_or(self.start_price);
        let step_bps: i64 = self.rng.gen_range(-25..=25);
        let close = (open * (Decimal::ONE + Decimal::new(step_bps, 4))).round_dp(2).max(dec!(0.01));
        let wick: i64 = self.rng.gen_range(0..=10);
        let high = (open.max(close) * (Decimal::ONE + Decimal::new(wick, 4))).round_dp(2);
        let low = (open.min(close) * (Decimal::ONE - Decimal::new(wick, 4))).round_dp(2);
        let volume = Decimal::from(self.rng.gen_range(100u32..=5000));
        self.last_close.insert(symbol.to_string(), close);
        Bar { ts, open, high, low, close, volume, symbol: symbol.to_string() }
    }
}

impl DataFeed for MockFeed {
    fn fetch_bars(&mut self, symbol: &str, interval: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Bar>, FetchError> {
        let step = parse_interval(interval)?;
        let now = self.clock.now();
        // last fully closed bar boundary
        let latest = now.duration_trunc(step).map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let mut ts = match since {
            Some(s) => s + step,
            None => latest,
        };
        let mut out = Vec::new();
        while ts <= latest && out.len() < self.max_batch {
            out.push(self.next_bar(symbol, ts));
            ts = ts + step;
        }
        Ok(out)
    }
}
