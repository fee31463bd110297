// ===============================
// src/state.rs (checkpoint antar iterasi)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : state.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// LiveState ditulis ulang secara atomik tiap checkpoint (state.json).
// session_id TIDAK diambil dari file saat reload: sesi baru tetap pakai id
// miliknya sendiri walau melanjutkan state lama.
//
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Order, Position};
use crate::recorder::{read_json, write_json_atomic, PersistError};

/// Key for per-(strategy, symbol) maps.
pub fn pair_key(strategy: &str, symbol: &str) -> String { format!("{strategy}:{symbol}") }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DayMetrics {
    pub date: Option<NaiveDate>,
    pub open_equity: Decimal,
    /// Gross traded notional today as a fraction of NAV.
    pub turnover: Decimal,
    /// Signed return since the day open, per strategy.
    pub strategy_returns: BTreeMap<String, Decimal>,
    pub cooldown_days_remaining: u32,
}

impl DayMetrics {
    /// New UTC day: tick the cooldown down and reset the daily counters.
    pub fn roll(&mut self, ts: DateTime<Utc>, equity: Decimal) {
        let today = ts.date_naive();
        if self.date == Some(today) {
            return;
        }
        if self.date.is_some() {
            self.cooldown_days_remaining = self.cooldown_days_remaining.saturating_sub(1);
        }
        self.date = Some(today);
        self.open_equity = equity;
        self.turnover = Decimal::ZERO;
        self.strategy_returns.clear();
    }

    pub fn arm_cooldown(&mut self, days: u32) {
        if self.cooldown_days_remaining == 0 {
            self.cooldown_days_remaining = days;
        }
    }

    pub fn cooldown_active(&self) -> bool { self.cooldown_days_remaining > 0 }

    /// Signed fraction of the day-open equity.
    pub fn portfolio_return(&self, equity: Decimal) -> Decimal {
        if self.open_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (equity - self.open_equity) / self.open_equity
    }

    pub fn strategy_return(&self, strategy: &str) -> Decimal {
        self.strategy_returns.get(strategy).copied().unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveState {
    pub session_id: String,
    /// Latest bar seen by any strategy.
    pub last_bar_ts: Option<DateTime<Utc>>,
    /// Latest bar per `strategy:symbol`.
    pub last_bars: BTreeMap<String, DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub open_orders: BTreeMap<String, Order>,
    pub positions: BTreeMap<String, Position>,
    pub consecutive_rejects: u32,
    /// Counter for `{strategy}-{seq:08}` client ids, kept across restarts.
    pub next_client_seq: u64,
    pub day: DayMetrics,
    /// Recent per-bar traded notional (volume * close), for ADV.
    pub volume_history: BTreeMap<String, VecDeque<Decimal>>,
}

impl LiveState {
    pub fn new(session_id: impl Into<String>) -> Self { Self { session_id: session_id.into(), ..Default::default() } }

    /// Missing file -> fresh state. The stored session id is discarded.
    pub fn load(path: &Path, session_id: &str) -> Result<Self, PersistError> {
        let mut state: LiveState = read_json(path)?.unwrap_or_default();
        state.session_id = session_id.to_string();
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> { write_json_atomic(path, self) }

    pub fn last_bar_for(&self, strategy: &str, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_bars.get(&pair_key(strategy, symbol)).copied()
    }

    pub fn record_bar(&mut self, strategy: &str, symbol: &str, ts: DateTime<Utc>) {
        let entry = self.last_bars.entry(pair_key(strategy, symbol)).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
        if self.last_bar_ts.map(|cur| ts > cur).unwrap_or(true) {
            self.last_bar_ts = Some(ts);
        }
    }

    pub fn record_volume(&mut self, symbol: &str, notional: Decimal, lookback: usize) {
        let hist = self.volume_history.entry(symbol.to_string()).or_default();
        hist.push_back(notional);
        while hist.len() > lookback.max(1) {
            hist.pop_front();
        }
    }

    pub fn volume_for(&self, symbol: &str) -> Vec<Decimal> {
        self.volume_history.get(symbol).map(|h| h.iter().copied().collect()).unwrap_or_default()
    }

    pub fn next_client_id(&mut self, strategy: &str) -> String {
        let id = format!("{strategy}-{:08}", self.next_client_seq);
        self.next_client_seq += 1;
        id
    }

    pub fn update_equity(&mut self, equity: Decimal) {
        self.equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }
}
