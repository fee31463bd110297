// ===============================
// src/router.rs (throttle + idempotency + in-flight)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : router.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Semua order dari strategi lewat sini sebelum ke broker:
// 1) halted?            -> router_halted
// 2) idempotency cache  -> replay keputusan lama apa adanya
// 3) sliding window 1s  -> rate_limited
// 4) in-flight penuh    -> inflight_limit
// 5) accepted           -> id baru, catat in-flight
//
// Fill yang tidak dikenal saat reconcile = fail-closed (router halt sampai
// operator memanggil resume()).
//
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::recorder::{read_json, write_json_atomic, PersistError};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid router config: {0}")]
    InvalidConfig(&'static str),
    #[error("snapshot {field} = {snapshot} does not match configured {configured}")]
    ConfigMismatch { field: &'static str, snapshot: u32, configured: u32 },
    #[error("no router snapshot at {0}")]
    Missing(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub strategy_id: String,
    pub symbol: String,
    /// Signed: positive buys, negative sells.
    pub quantity: Decimal,
    pub price: Decimal,
    pub client_order_id: String,
    pub idempotency_key: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderRequest {
    pub fn key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.strategy_id, self.client_order_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDecision {
    pub accepted: bool,
    pub order_id: Option<String>,
    pub reason: String,
}

impl OrderDecision {
    fn rejected(reason: &str) -> Self { Self { accepted: false, order_id: None, reason: reason.to_string() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub order_id: String,
    pub status: String,
    pub filled_qty: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub resolved: Vec<String>,
    pub unknown_fills: Vec<String>,
    pub remaining_inflight: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub rate_limit_per_sec: u32,
    pub max_inflight: u32,
    pub next_sequence: u64,
    pub halted: bool,
    pub rate_counters: BTreeMap<String, Vec<DateTime<Utc>>>,
    pub inflight: BTreeMap<String, OrderRequest>,
    pub idempotency: BTreeMap<String, OrderDecision>,
}

#[derive(Debug)]
pub struct OrderRouter {
    rate_limit: u32,
    max_inflight: u32,
    windows: BTreeMap<String, VecDeque<DateTime<Utc>>>,
    inflight: BTreeMap<String, OrderRequest>,
    idempotency: BTreeMap<String, OrderDecision>,
    next_seq: u64,
    halted: bool,
}

impl OrderRouter {
    pub fn new(rate_limit_per_sec: u32, max_inflight: u32) -> Result<Self, RouterError> {
        if rate_limit_per_sec == 0 {
            return Err(RouterError::InvalidConfig("rate_limit_per_sec must be positive"));
        }
        if max_inflight == 0 {
            return Err(RouterError::InvalidConfig("max_inflight must be positive"));
        }
        Ok(Self {
            rate_limit: rate_limit_per_sec,
            max_inflight,
            windows: BTreeMap::new(),
            inflight: BTreeMap::new(),
            idempotency: BTreeMap::new(),
            next_seq: 1,
            halted: false,
        })
    }

    pub fn submit(&mut self, request: OrderRequest, now: DateTime<Utc>) -> OrderDecision {
        if self.halted {
            return OrderDecision::rejected("router_halted");
        }
        let key = request.key();
        if let Some(cached) = self.idempotency.get(&key) {
            return cached.clone();
        }

        let window = self.windows.entry(request.strategy_id.clone()).or_default();
        let cutoff = now - Duration::seconds(1);
        while window.front().map(|ts| *ts < cutoff).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() >= self.rate_limit as usize {
            let d = OrderDecision::rejected("rate_limited");
            self.idempotency.insert(key, d.clone());
            return d;
        }
        if self.inflight.len() >= self.max_inflight as usize {
            let d = OrderDecision::rejected("inflight_limit");
            self.idempotency.insert(key, d.clone());
            return d;
        }

        let order_id = format!("RT-{:08}", self.next_seq);
        self.next_seq += 1;
        window.push_back(now);
        self.inflight.insert(order_id.clone(), request);
        let d = OrderDecision { accepted: true, order_id: Some(order_id), reason: "accepted".into() };
        self.idempotency.insert(key, d.clone());
        d
    }

    pub fn reconcile<I: IntoIterator<Item = FillReport>>(&mut self, fills: I) -> ReconciliationResult {
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();
        for fill in fills {
            let Some(request) = self.inflight.remove(&fill.order_id) else {
                unknown.push(fill.order_id);
                continue;
            };
            if let Some(decision) = self.idempotency.get_mut(&request.key()) {
                decision.reason = fill.status.to_ascii_lowercase();
            }
            resolved.push(fill.order_id);
        }
        if !unknown.is_empty() {
            self.halted = true;
            warn!(unknown = ?unknown, "router halted: fills with no in-flight order");
        }
        ReconciliationResult { resolved, unknown_fills: unknown, remaining_inflight: self.inflight.len() }
    }

    pub fn pending_orders(&self) -> &BTreeMap<String, OrderRequest> { &self.inflight }

    pub fn is_halted(&self) -> bool { self.halted }

    /// Operator override after an unknown fill has been explained.
    pub fn resume(&mut self) {
        if self.halted {
            info!("router resumed by operator");
        }
        self.halted = false;
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            rate_limit_per_sec: self.rate_limit,
            max_inflight: self.max_inflight,
            next_sequence: self.next_seq,
            halted: self.halted,
            rate_counters: self.windows.iter().map(|(k, w)| (k.clone(), w.iter().copied().collect())).collect(),
            inflight: self.inflight.clone(),
            idempotency: self.idempotency.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: RouterSnapshot) -> Result<(), RouterError> {
        if snapshot.rate_limit_per_sec != self.rate_limit {
            return Err(RouterError::ConfigMismatch {
                field: "rate_limit_per_sec",
                snapshot: snapshot.rate_limit_per_sec,
                configured: self.rate_limit,
            });
        }
        if snapshot.max_inflight != self.max_inflight {
            return Err(RouterError::ConfigMismatch {
                field: "max_inflight",
                snapshot: snapshot.max_inflight,
                configured: self.max_inflight,
            });
        }
        self.next_seq = snapshot.next_sequence;
        self.halted = snapshot.halted;
        self.windows = snapshot.rate_counters.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect();
        self.inflight = snapshot.inflight;
        self.idempotency = snapshot.idempotency;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), RouterError> {
        write_json_atomic(path, &self.snapshot())?;
        Ok(())
    }

    /// Build a router with the given config and restore the snapshot at `path`.
    pub fn load(path: &Path, rate_limit_per_sec: u32, max_inflight: u32) -> Result<Self, RouterError> {
        let snapshot: RouterSnapshot =
            read_json(path)?.ok_or_else(|| RouterError::Missing(path.display().to_string()))?;
        let mut router = Self::new(rate_limit_per_sec, max_inflight)?;
        router.restore(snapshot)?;
        info!(path = %path.display(), inflight = router.inflight.len(), halted = router.halted, "router state restored");
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 6, 3, 13, 0, 0).unwrap() }

    fn req(strategy: &str, cid: &str) -> OrderRequest {
        OrderRequest {
            strategy_id: strategy.into(),
            symbol: "BTC".into(),
            quantity: dec!(1),
            price: dec!(100),
            client_order_id: cid.into(),
            idempotency_key: None,
            timestamp: None,
        }
    }

    #[test]
    fn replay_returns_same_decision() {
        let mut r = OrderRouter::new(5, 10).unwrap();
        let a = r.submit(req("s", "c1"), t0());
        let b = r.submit(req("s", "c1"), t0() + Duration::milliseconds(5));
        assert!(a.accepted);
        assert_eq!(a, b);
        assert_eq!(a.order_id.as_deref(), Some("RT-00000001"));
        assert_eq!(r.pending_orders().len(), 1);
    }

    #[test]
    fn replay_does_not_consume_rate_window() {
        let mut r = OrderRouter::new(2, 100).unwrap();
        let a = r.submit(req("s", "a"), t0());
        assert!(a.accepted);
        assert_eq!(r.submit(req("s", "a"), t0() + Duration::milliseconds(10)), a);
        assert!(r.submit(req("s", "b"), t0() + Duration::milliseconds(20)).accepted);
        assert_eq!(r.submit(req("s", "c"), t0() + Duration::milliseconds(30)).reason, "rate_limited");
        assert_eq!(r.snapshot().rate_counters["s"].len(), 2);
    }

    #[test]
    fn sliding_window_is_exact() {
        let mut r = OrderRouter::new(2, 100).unwrap();
        assert!(r.submit(req("s", "1"), t0()).accepted);
        assert!(r.submit(req("s", "2"), t0() + Duration::milliseconds(500)).accepted);
        assert_eq!(r.submit(req("s", "3"), t0() + Duration::milliseconds(999)).reason, "rate_limited");
        // entry at t0 is exactly 1s old: still in the window
        assert_eq!(r.submit(req("s", "4"), t0() + Duration::seconds(1)).reason, "rate_limited");
        assert!(r.submit(req("s", "5"), t0() + Duration::milliseconds(1001)).accepted);
        // other strategies have their own window
        assert!(r.submit(req("other", "1"), t0() + Duration::milliseconds(1001)).accepted);
    }

    #[test]
    fn rejection_is_cached_under_key() {
        let mut r = OrderRouter::new(1, 100).unwrap();
        r.submit(req("s", "1"), t0());
        let rej = r.submit(req("s", "2"), t0());
        assert_eq!(rej.reason, "rate_limited");
        // window has cleared but the cached rejection wins
        let again = r.submit(req("s", "2"), t0() + Duration::seconds(10));
        assert_eq!(again, rej);
    }

    #[test]
    fn inflight_limit() {
        let mut r = OrderRouter::new(100, 1).unwrap();
        assert!(r.submit(req("s", "1"), t0()).accepted);
        assert_eq!(r.submit(req("s", "2"), t0()).reason, "inflight_limit");
    }

    #[test]
    fn unknown_fill_halts_router() {
        let mut r = OrderRouter::new(5, 10).unwrap();
        let d = r.submit(req("s", "1"), t0());
        let id = d.order_id.unwrap();
        let res = r.reconcile(vec![
            FillReport { order_id: id.clone(), status: "FILLED".into(), filled_qty: dec!(1), timestamp: t0() },
            FillReport { order_id: "ghost".into(), status: "filled".into(), filled_qty: dec!(1), timestamp: t0() },
        ]);
        assert_eq!(res.resolved, vec![id]);
        assert_eq!(res.unknown_fills, vec!["ghost".to_string()]);
        assert_eq!(res.remaining_inflight, 0);
        assert!(r.is_halted());
        assert_eq!(r.submit(req("s", "9"), t0()).reason, "router_halted");
        // cached decision now carries the terminal status
        r.resume();
        assert_eq!(r.submit(req("s", "1"), t0()).reason, "filled");
    }

    #[test]
    fn snapshot_round_trip_and_config_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router_state.json");
        let mut r = OrderRouter::new(3, 8).unwrap();
        r.submit(req("s", "1"), t0());
        r.submit(req("s", "2"), t0());
        r.save(&path).unwrap();

        let restored = OrderRouter::load(&path, 3, 8).unwrap();
        assert_eq!(restored.snapshot(), r.snapshot());

        let err = OrderRouter::load(&path, 4, 8).unwrap_err();
        assert!(matches!(err, RouterError::ConfigMismatch { field: "rate_limit_per_sec", .. }));

        let mut next = OrderRouter::load(&path, 3, 8).unwrap();
        assert_eq!(next.submit(req("s", "3"), t0()).order_id.as_deref(), Some("RT-00000003"));
    }

    #[test]
    fn zero_config_is_rejected() {
        assert!(OrderRouter::new(0, 1).is_err());
        assert!(OrderRouter::new(1, 0).is_err());
    }
}
