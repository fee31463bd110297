// ===============================
// src/runner.rs (control loop)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : runner.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Satu task tokio, kooperatif:
//   stop? -> max_loops? -> tunggu slot scheduler -> per strategi yang due:
//     circuit breaker -> fetch bar -> per bar: mark broker, day metrics,
//     generator -> risk -> router -> broker -> fills -> reconcile ->
//     positions/account -> persist state
//
// Semua jalur keluar (halt, stop, error) tetap menulis router snapshot,
// session.md, metrics.prom, lalu melepas run.log.
//
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::clock::SharedClock;
use crate::domain::{Bar, Order, OrderStatus, OrderType};
use crate::feed::{parse_interval, DataFeed, FetchError};
use crate::metrics::{self, LoopMetrics, BARS, DRAWDOWN_BPS, EQUITY, HALTS, LOOPS, PNL_REALIZED, PNL_UNREALIZED, REJECTS};
use crate::recorder::{AccountRow, CsvLog, JsonlLog, OrderRow, PersistError, PositionRow, TradeRow};
use crate::risk::{
    check_circuit_breakers, check_order_limits, compute_adv_notional, compute_drawdown_bps, compute_participation,
    PortfolioContext, RiskContext, RiskLimits,
};
use crate::router::{FillReport, OrderRequest, OrderRouter, RouterError};
use crate::scheduler::{Scheduler, SchedulerError, StrategySpec};
use crate::session::{self, SessionPaths, SessionSummary};
use crate::state::LiveState;
use crate::strategy::OrderIntentGenerator;

pub const HALT_COMPLETED: &str = "completed";
pub const HALT_MAX_LOOPS: &str = "max_loops_reached";
pub const HALT_STOP: &str = "stop_requested";
pub const HALT_FEED_ERROR: &str = "feed_error";
pub const HALT_NO_NEW_BARS: &str = "no_new_bars";
pub const HALT_ROUTER: &str = "router_halted";
pub const HALT_RUNNER_ERROR: &str = "runner_error";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Feed(#[from] FetchError),
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_loops: Option<u64>,
    pub router_rate_limit: u32,
    pub router_max_inflight: u32,
    pub metrics_window: usize,
    /// 0 = only at exit.
    pub router_snapshot_interval: Duration,
    pub scheduler_seed: Option<u64>,
    pub currency: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_loops: None,
            router_rate_limit: 5,
            router_max_inflight: 256,
            metrics_window: metrics::DEFAULT_WINDOW,
            router_snapshot_interval: Duration::seconds(30),
            scheduler_seed: None,
            currency: "USD".to_string(),
        }
    }
}

/// One strategy on one symbol.
pub struct StrategyBinding {
    pub spec: StrategySpec,
    pub symbol: String,
    pub interval: String,
    pub generator: Box<dyn OrderIntentGenerator>,
}

impl StrategyBinding {
    pub fn new(spec: StrategySpec, symbol: impl Into<String>, interval: impl Into<String>, generator: Box<dyn OrderIntentGenerator>) -> Self {
        Self { spec, symbol: symbol.into(), interval: interval.into(), generator }
    }

    /// Cadence = bar interval; budget = max(50ms, cadence * fraction);
    /// jitter capped at one cadence; heartbeat timeout = 3 cadences.
    pub fn for_interval(
        name: &str,
        symbol: &str,
        interval: &str,
        budget_fraction: f64,
        jitter: Duration,
        generator: Box<dyn OrderIntentGenerator>,
    ) -> Result<Self, RunnerError> {
        let cadence = parse_interval(interval)?;
        let frac = budget_fraction.max(0.01);
        let budget_ms = ((cadence.num_milliseconds() as f64) * frac) as i64;
        let budget = Duration::milliseconds(budget_ms.max(50));
        let jitter = jitter.max(Duration::zero()).min(cadence);
        let spec = StrategySpec::new(name, cadence, budget)?
            .with_jitter(jitter)?
            .with_heartbeat_timeout(cadence * 3);
        Ok(Self::new(spec, symbol, interval, generator))
    }
}

/// Cloneable stop trigger; the loop exits with `stop_requested` at its next
/// check or while idling.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) { let _ = self.tx.send(true); }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunnerEvent<'a> {
    CircuitBreaker { reason: &'a str, strategy: &'a str, symbol: &'a str, ts: DateTime<Utc>, equity: Decimal, position: Decimal },
    FeedError { reason: String, strategy: &'a str, symbol: &'a str, ts: DateTime<Utc> },
    OrderReject { reason: &'a str, strategy: &'a str, symbol: &'a str, ts: DateTime<Utc> },
    RouterReject { reason: &'a str, strategy: &'a str, client_order_id: &'a str, ts: DateTime<Utc> },
    BrokerError { reason: String, strategy: &'a str, order_id: &'a str, ts: DateTime<Utc> },
    OrderExpired { order_id: &'a str, router_id: &'a str, ts: DateTime<Utc> },
    State { ts: DateTime<Utc>, equity: Decimal, peak_equity: Decimal, realized_pnl: Decimal, consecutive_rejects: u32, open_orders: usize },
    Halt { reason: &'a str, ts: DateTime<Utc> },
}

enum Flow {
    Continue,
    Halt(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: SessionSummary,
    pub loops: u64,
}

struct Artifacts {
    events: JsonlLog,
    loop_metrics: JsonlLog,
    trades: CsvLog,
    orders: CsvLog,
    positions: CsvLog,
    account: CsvLog,
}

impl Artifacts {
    fn new(paths: &SessionPaths) -> Self {
        Self {
            events: JsonlLog::new(&paths.state_events_file),
            loop_metrics: JsonlLog::new(&paths.loop_metrics_file),
            trades: CsvLog::new(&paths.trades_file),
            orders: CsvLog::new(&paths.orders_file),
            positions: CsvLog::new(&paths.positions_file),
            account: CsvLog::new(&paths.account_file),
        }
    }
}

pub struct RunnerLoop<B: Broker, F: DataFeed> {
    cfg: RunnerConfig,
    limits: RiskLimits,
    paths: SessionPaths,
    out: Artifacts,
    broker: B,
    feed: F,
    clock: SharedClock,
    bindings: Vec<StrategyBinding>,
    scheduler: Scheduler,
    router: OrderRouter,
    state: LiveState,
    metrics: LoopMetrics,
    marks: HashMap<String, Decimal>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    last_router_snapshot: Option<DateTime<Utc>>,
    loops: u64,
    started_at: Option<DateTime<Utc>>,
}

fn frac(n: Decimal, nav: Decimal) -> Decimal {
    if nav <= Decimal::ZERO { Decimal::ZERO } else { n / nav }
}

fn f64_of(d: Decimal) -> f64 { d.to_f64().unwrap_or(0.0) }

impl<B: Broker, F: DataFeed> RunnerLoop<B, F> {
    pub fn new(
        cfg: RunnerConfig,
        limits: RiskLimits,
        paths: SessionPaths,
        mut broker: B,
        feed: F,
        clock: SharedClock,
        bindings: Vec<StrategyBinding>,
    ) -> Result<Self, RunnerError> {
        metrics::init();
        let state = LiveState::load(&paths.state_file, &paths.session_id)?;
        if !state.positions.is_empty() || !state.realized_pnl.is_zero() {
            if let Err(e) = broker.bootstrap_positions(&state.positions, state.realized_pnl) {
                warn!(error = %e, "bootstrap positions into broker failed");
            }
        }

        let now = clock.now();
        let mut scheduler = Scheduler::new(now, cfg.scheduler_seed);
        for b in &bindings {
            scheduler.register(b.spec.clone(), None)?;
        }

        let mut router = OrderRouter::new(cfg.router_rate_limit, cfg.router_max_inflight)?;
        let mut last_router_snapshot = None;
        if paths.router_state_file.exists() {
            match OrderRouter::load(&paths.router_state_file, cfg.router_rate_limit, cfg.router_max_inflight) {
                Ok(restored) => {
                    router = restored;
                    last_router_snapshot = Some(now);
                }
                Err(e) => warn!(error = %e, "router snapshot ignored"),
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut runner = Self {
            out: Artifacts::new(&paths),
            metrics: LoopMetrics::new(cfg.metrics_window),
            cfg,
            limits,
            paths,
            broker,
            feed,
            clock,
            bindings,
            scheduler,
            router,
            state,
            marks: HashMap::new(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            last_router_snapshot,
            loops: 0,
            started_at: None,
        };
        runner.expire_orphaned_orders(now)?;
        Ok(runner)
    }

    /// Orders restored from disk that the broker no longer has on its book
    /// (fresh paper venue after a restart) can never fill. Drop them from
    /// `open_orders` and close their router entries as expired, including
    /// router entries that never reached the broker.
    fn expire_orphaned_orders(&mut self, now: DateTime<Utc>) -> Result<(), RunnerError> {
        let orphaned: Vec<String> =
            self.state.open_orders.keys().filter(|id| !self.broker.knows_order(id)).cloned().collect();
        for broker_id in &orphaned {
            if let Some(order) = self.state.open_orders.remove(broker_id) {
                let router_id = order.intent.client_order_id.clone().unwrap_or_default();
                warn!(order_id = %broker_id, %router_id, "restored order unknown to broker, expiring");
                self.event(&RunnerEvent::OrderExpired { order_id: broker_id, router_id: &router_id, ts: now })?;
            }
        }

        let live: Vec<String> = self.state.open_orders.values().filter_map(|o| o.intent.client_order_id.clone()).collect();
        let reports: Vec<FillReport> = self
            .router
            .pending_orders()
            .keys()
            .filter(|id| !live.contains(*id))
            .map(|id| FillReport {
                order_id: id.clone(),
                status: OrderStatus::Expired.as_str().to_string(),
                filled_qty: Decimal::ZERO,
                timestamp: now,
            })
            .collect();
        if !reports.is_empty() {
            let result = self.router.reconcile(reports);
            info!(expired = result.resolved.len(), remaining = result.remaining_inflight, "stale router entries closed");
        }
        if !orphaned.is_empty() {
            self.state.save(&self.paths.state_file)?;
        }
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle { StopHandle { tx: self.stop_tx.clone() } }

    pub fn stop(&self) { self.stop_handle().stop(); }

    pub fn state(&self) -> &LiveState { &self.state }

    pub fn broker(&self) -> &B { &self.broker }

    pub fn router(&self) -> &OrderRouter { &self.router }

    pub fn scheduler(&self) -> &Scheduler { &self.scheduler }

    pub fn paths(&self) -> &SessionPaths { &self.paths }

    pub async fn run(&mut self) -> Result<RunReport, RunnerError> {
        let _log = match session::attach_log(&self.paths.run_log) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(error = %e, "session log unavailable, continuing without run.log");
                None
            }
        };
        let started = self.clock.now();
        self.started_at = Some(started);
        info!(
            session_id = %self.paths.session_id,
            strategies = ?self.bindings.iter().map(|b| b.spec.name.as_str()).collect::<Vec<_>>(),
            symbols = ?self.bindings.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>(),
            max_loops = ?self.cfg.max_loops,
            "starting runner"
        );

        let outcome = self.drive().await;
        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(e) => {
                error!(error = %e, "runner aborted");
                HALT_RUNNER_ERROR.to_string()
            }
        };
        let report = self.finish(&reason);
        outcome?;
        report
    }

    async fn drive(&mut self) -> Result<String, RunnerError> {
        loop {
            if *self.stop_rx.borrow() {
                return Ok(HALT_STOP.to_string());
            }
            if self.max_loops_hit() {
                return Ok(HALT_MAX_LOOPS.to_string());
            }
            let Some(next) = self.scheduler.next_due() else {
                return Ok(HALT_COMPLETED.to_string());
            };

            let wait = self.clock.idle_until(next);
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = self.stop_rx.changed() => {
                        if changed.is_err() {
                            return Ok(HALT_STOP.to_string());
                        }
                        continue;
                    }
                }
            }

            let now = self.clock.now();
            let due = self.scheduler.due(now);
            self.metrics.record_queue_depth(due.len());
            if due.is_empty() {
                continue;
            }
            LOOPS.inc();

            for name in due {
                let Some(idx) = self.bindings.iter().position(|b| b.spec.name == name) else { continue };
                self.scheduler.mark_start(&name, now)?;
                let wall = Instant::now();
                let flow = self.run_strategy(idx, now);
                let elapsed = wall.elapsed();
                let finish = now + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero());
                let skipped = self.scheduler.mark_finish(&name, finish)?;
                self.scheduler.record_heartbeat(&name, finish)?;
                self.metrics.record_tick(&name, elapsed.as_secs_f64(), skipped);
                self.emit_loop_metrics(finish);
                self.maybe_snapshot_router(finish);

                match flow? {
                    Flow::Continue => self.loops += 1,
                    Flow::Halt(reason) => return Ok(reason),
                }
                if *self.stop_rx.borrow() {
                    return Ok(HALT_STOP.to_string());
                }
                if self.max_loops_hit() {
                    return Ok(HALT_MAX_LOOPS.to_string());
                }
            }

            for late in self.scheduler.late_heartbeats(self.clock.now()) {
                debug!(strategy = %late, "heartbeat late");
            }
        }
    }

    fn max_loops_hit(&self) -> bool { self.cfg.max_loops.map(|max| self.loops >= max).unwrap_or(false) }

    fn event(&self, ev: &RunnerEvent<'_>) -> Result<(), RunnerError> {
        self.out.events.append(ev)?;
        Ok(())
    }

    fn persist_state(&self, ts: DateTime<Utc>) -> Result<(), RunnerError> {
        self.state.save(&self.paths.state_file)?;
        self.event(&RunnerEvent::State {
            ts,
            equity: self.state.equity,
            peak_equity: self.state.peak_equity,
            realized_pnl: self.state.realized_pnl,
            consecutive_rejects: self.state.consecutive_rejects,
            open_orders: self.state.open_orders.len(),
        })
    }

    fn run_strategy(&mut self, idx: usize, now: DateTime<Utc>) -> Result<Flow, RunnerError> {
        let name = self.bindings[idx].spec.name.clone();
        let symbol = self.bindings[idx].symbol.clone();
        let interval = self.bindings[idx].interval.clone();

        let account = self.broker.account()?;
        if self.state.equity <= Decimal::ZERO {
            self.state.equity = account.equity;
        }
        if self.state.peak_equity < account.equity {
            self.state.peak_equity = account.equity;
        }
        let position_qty = account.position_qty(&symbol);
        let last_bar = self.state.last_bar_for(&name, &symbol);

        let mut ctx = RiskContext::new(now);
        ctx.equity = account.equity;
        ctx.position_quantity = position_qty;
        ctx.realized_drawdown_bps = compute_drawdown_bps(account.equity, self.state.peak_equity);
        ctx.consecutive_rejects = self.state.consecutive_rejects;
        ctx.last_bar_ts = last_bar.unwrap_or(now);
        let decision = check_circuit_breakers(&self.limits, &ctx);
        if !decision.allowed {
            warn!(strategy = %name, %symbol, reason = decision.reason, "circuit breaker tripped, halting");
            self.event(&RunnerEvent::CircuitBreaker {
                reason: decision.reason,
                strategy: &name,
                symbol: &symbol,
                ts: now,
                equity: account.equity,
                position: position_qty,
            })?;
            self.state.equity = account.equity;
            if let Some(pos) = account.positions.get(&symbol) {
                self.state.positions.insert(symbol.clone(), pos.clone());
            }
            self.persist_state(now)?;
            return Ok(Flow::Halt(decision.reason.to_string()));
        }

        let bars = match self.feed.fetch_bars(&symbol, &interval, last_bar) {
            Ok(bars) => bars,
            Err(e) => {
                error!(strategy = %name, %symbol, error = %e, "data feed failure");
                self.metrics.record_error(HALT_FEED_ERROR);
                self.event(&RunnerEvent::FeedError { reason: e.to_string(), strategy: &name, symbol: &symbol, ts: now })?;
                return Ok(Flow::Halt(HALT_FEED_ERROR.to_string()));
            }
        };
        if bars.is_empty() {
            debug!(strategy = %name, %symbol, "no new bars");
            return Ok(Flow::Halt(HALT_NO_NEW_BARS.to_string()));
        }

        for bar in &bars {
            let halt = self.process_bar(idx, bar, now)?;
            self.state.record_bar(&name, &symbol, bar.ts);
            if let Some(reason) = halt {
                self.persist_state(now)?;
                return Ok(Flow::Halt(reason));
            }
        }
        self.persist_state(now)?;
        Ok(Flow::Continue)
    }

    /// Returns a halt reason when the router stopped accepting work.
    fn process_bar(&mut self, idx: usize, bar: &Bar, iteration_start: DateTime<Utc>) -> Result<Option<String>, RunnerError> {
        let name = self.bindings[idx].spec.name.clone();
        let ts = bar.ts;
        let session_id = self.paths.session_id.clone();

        self.broker.on_market_data(&bar.symbol, bar.close, ts)?;
        self.state.record_volume(&bar.symbol, bar.volume * bar.close, self.limits.adv_lookback_days);
        self.marks.insert(bar.symbol.clone(), bar.close);
        BARS.with_label_values(&[&bar.symbol]).inc();

        let account = self.broker.account()?;
        self.state.day.roll(ts, account.equity);
        let day_return = self.state.day.portfolio_return(account.equity);
        self.state.day.strategy_returns.insert(name.clone(), day_return);

        let mut position_qty = account.position_qty(&bar.symbol);
        let intents = self.bindings[idx].generator.generate(std::slice::from_ref(bar), position_qty);

        // exposures as fractions of NAV
        let nav = account.equity;
        let mut class_exposures: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut symbol_exposures: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut gross = Decimal::ZERO;
        for pos in account.positions.values() {
            let price = match self.marks.get(&pos.symbol) {
                Some(p) if *p > Decimal::ZERO => *p,
                _ if pos.avg_price > Decimal::ZERO => pos.avg_price,
                _ => bar.close,
            };
            let exposure = frac((pos.quantity * price).abs(), nav);
            symbol_exposures.insert(pos.symbol.clone(), exposure);
            *class_exposures.entry(self.limits.asset_class_of(&pos.symbol)).or_default() += exposure;
            gross += exposure;
        }
        let asset_class = self.limits.asset_class_of(&bar.symbol);
        let mut symbol_exp = symbol_exposures.get(&bar.symbol).copied().unwrap_or(Decimal::ZERO);
        let mut class_exp = class_exposures.get(&asset_class).copied().unwrap_or(Decimal::ZERO);
        let adv = compute_adv_notional(self.state.volume_for(&bar.symbol));

        let peak = self.state.peak_equity.max(account.equity);
        let portfolio_drawdown = frac(peak - account.equity, peak);
        if self.limits.portfolio_drawdown_cap > Decimal::ZERO && portfolio_drawdown >= self.limits.portfolio_drawdown_cap {
            self.state.day.arm_cooldown(self.limits.cooldown_days);
        }
        let session_equity = if self.state.equity > Decimal::ZERO { self.state.equity } else { account.equity };
        let session_peak = if self.state.peak_equity > Decimal::ZERO { self.state.peak_equity } else { account.equity };

        let mut router_reports: Vec<FillReport> = Vec::new();
        let mut halt: Option<String> = None;

        for intent in intents {
            let signed = intent.signed_quantity();
            let price = bar.close;
            let order_notional = (signed * price).abs();
            let projected_symbol = frac(((position_qty + signed) * price).abs(), nav);
            let projected_class = class_exp - symbol_exp + projected_symbol;
            let projected_gross = gross - symbol_exp + projected_symbol;
            let projected_turnover = self.state.day.turnover + frac(order_notional, nav);
            let participation = compute_participation(order_notional, adv);

            let ctx = RiskContext {
                equity: account.equity,
                position_quantity: position_qty,
                realized_drawdown_bps: compute_drawdown_bps(session_equity, session_peak),
                consecutive_rejects: self.state.consecutive_rejects,
                last_bar_ts: ts,
                now_ts: ts,
                portfolio: PortfolioContext {
                    strategy_id: name.clone(),
                    asset_class: asset_class.clone(),
                    gross_exposure: gross,
                    projected_gross_exposure: projected_gross,
                    symbol_exposure: symbol_exp,
                    projected_symbol_exposure: projected_symbol,
                    class_exposure: class_exp,
                    projected_class_exposure: projected_class,
                    portfolio_drawdown,
                    daily_portfolio_loss: day_return,
                    strategy_daily_loss: self.state.day.strategy_return(&name),
                    cooldown_active: self.state.day.cooldown_active(),
                    projected_turnover,
                    order_participation: participation,
                    reducing: projected_symbol <= symbol_exp,
                },
            };
            let decision = check_order_limits(&bar.symbol, signed, price, &self.limits, &ctx);
            for w in &decision.warnings {
                warn!(code = *w, symbol = %bar.symbol, %projected_turnover, %participation, "risk warning");
            }
            if !decision.allowed {
                if decision.reason == "portfolio_drawdown_cap" {
                    self.state.day.arm_cooldown(self.limits.cooldown_days);
                }
                warn!(strategy = %name, symbol = %bar.symbol, reason = decision.reason, "order rejected by risk");
                self.state.consecutive_rejects += 1;
                self.metrics.record_error(decision.reason);
                REJECTS.with_label_values(&["risk", decision.reason]).inc();
                self.event(&RunnerEvent::OrderReject { reason: decision.reason, strategy: &name, symbol: &bar.symbol, ts })?;
                continue;
            }

            let client_id = self.state.next_client_id(&name);
            let request = OrderRequest {
                strategy_id: name.clone(),
                symbol: intent.symbol.clone(),
                quantity: signed,
                price: intent.limit_price.unwrap_or(bar.close),
                client_order_id: client_id.clone(),
                idempotency_key: Some(format!("{name}:{client_id}")),
                timestamp: Some(iteration_start),
            };
            let routed = self.router.submit(request, iteration_start);
            let router_id = match (routed.accepted, routed.order_id) {
                (true, Some(id)) => id,
                _ => {
                    let reason = if routed.reason.is_empty() { "router_rejected" } else { routed.reason.as_str() };
                    warn!(strategy = %name, %client_id, %reason, "router rejected order");
                    self.metrics.record_error(reason);
                    REJECTS.with_label_values(&["router", reason]).inc();
                    self.event(&RunnerEvent::RouterReject { reason, strategy: &name, client_order_id: &client_id, ts: iteration_start })?;
                    self.state.consecutive_rejects += 1;
                    if reason == HALT_ROUTER {
                        halt = Some(HALT_ROUTER.to_string());
                        break;
                    }
                    continue;
                }
            };

            let order = match self.broker.place_order(intent.with_client_id(router_id.clone())) {
                Ok(order) => order,
                Err(e) => {
                    error!(strategy = %name, order_id = %router_id, error = %e, "order placement failed");
                    self.state.consecutive_rejects += 1;
                    self.metrics.record_error("broker_error");
                    REJECTS.with_label_values(&["broker", "broker_error"]).inc();
                    self.event(&RunnerEvent::BrokerError { reason: e.to_string(), strategy: &name, order_id: &router_id, ts })?;
                    router_reports.push(FillReport {
                        order_id: router_id,
                        status: OrderStatus::Rejected.as_str().to_string(),
                        filled_qty: Decimal::ZERO,
                        timestamp: ts,
                    });
                    continue;
                }
            };

            self.out.orders.append(&OrderRow {
                ts: ts.to_rfc3339(),
                session_id: session_id.clone(),
                symbol: order.intent.symbol.clone(),
                strategy: name.clone(),
                id: router_id.clone(),
                side: order.intent.side.as_str().to_string(),
                order_type: order.intent.order_type.as_str().to_string(),
                qty: order.intent.quantity.to_string(),
                limit_price: order.intent.limit_price.map(|p| p.to_string()).unwrap_or_default(),
                state: order.status.as_str().to_string(),
                reject_reason: order.reject_reason.clone().unwrap_or_default(),
                broker_order_id: order.id.clone(),
            })?;

            if order.status == OrderStatus::Rejected {
                let reason = order.reject_reason.as_deref().unwrap_or("broker_reject");
                warn!(strategy = %name, order_id = %order.id, %reason, "broker rejected order");
                self.state.consecutive_rejects += 1;
                self.metrics.record_error("broker_reject");
                REJECTS.with_label_values(&["broker", reason]).inc();
            } else {
                self.state.consecutive_rejects = 0;
                position_qty += signed;
                self.state.day.turnover = projected_turnover;
                symbol_exp = projected_symbol.max(Decimal::ZERO);
                class_exp = projected_class.max(Decimal::ZERO);
                gross = projected_gross.max(Decimal::ZERO);
            }

            if matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired) {
                router_reports.push(FillReport {
                    order_id: router_id,
                    status: order.status.as_str().to_string(),
                    filled_qty: order.filled_qty,
                    timestamp: ts,
                });
            } else {
                // filled_qty here counts fills drained through poll_fills
                let mut tracked = order;
                tracked.filled_qty = Decimal::ZERO;
                self.state.open_orders.insert(tracked.id.clone(), tracked);
            }
        }

        let fill_reports = self.drain_fills(&name, &session_id)?;
        router_reports.extend(fill_reports);
        if !router_reports.is_empty() {
            let result = self.router.reconcile(router_reports);
            if !result.unknown_fills.is_empty() {
                error!(unknown = ?result.unknown_fills, "router halted due to unknown fills");
            }
            if self.router.is_halted() {
                self.metrics.record_error(HALT_ROUTER);
                halt = Some(HALT_ROUTER.to_string());
            }
        }

        self.update_state_from_broker(bar)?;
        Ok(halt)
    }

    /// Trade rows for every drained fill, tagged with the strategy that routed
    /// the order; a report per order once it is fully filled. Fills for orders we never tracked go out under the raw broker
    /// id, which the router treats as unknown.
    fn drain_fills(&mut self, strategy: &str, session_id: &str) -> Result<Vec<FillReport>, RunnerError> {
        let fills = self.broker.poll_fills()?;
        let mut reports = Vec::new();
        let mut rows = Vec::with_capacity(fills.len());
        for fill in fills {
            let (router_id, order_type, done) = match self.state.open_orders.get_mut(&fill.order_id) {
                Some(o) => {
                    o.filled_qty += fill.quantity;
                    o.status = if o.remaining() <= Decimal::ZERO { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
                    let router_id = o.intent.client_order_id.clone().unwrap_or_else(|| fill.order_id.clone());
                    (router_id, o.intent.order_type, o.status == OrderStatus::Filled)
                }
                None => {
                    warn!(order_id = %fill.order_id, fill_id = %fill.fill_id, "fill for untracked order");
                    (fill.order_id.clone(), OrderType::Market, true)
                }
            };
            // fills land in whichever iteration marks the symbol; credit the
            // strategy that routed the order
            let owner = self
                .router
                .pending_orders()
                .get(&router_id)
                .map(|r| r.strategy_id.clone())
                .unwrap_or_else(|| strategy.to_string());
            if done {
                let closed: Option<Order> = self.state.open_orders.remove(&fill.order_id);
                let filled_qty = closed.map(|o| o.filled_qty).unwrap_or(fill.quantity);
                reports.push(FillReport { order_id: router_id, status: OrderStatus::Filled.as_str().to_string(), filled_qty, timestamp: fill.ts });
            }
            rows.push(TradeRow {
                ts: fill.ts.to_rfc3339(),
                session_id: session_id.to_string(),
                symbol: fill.symbol.clone(),
                strategy: owner,
                id: fill.fill_id.clone(),
                side: fill.side.as_str().to_string(),
                qty: fill.quantity.to_string(),
                price: fill.price.to_string(),
                fees: fill.fee.to_string(),
                slip_bps: fill.slippage_bps.to_string(),
                order_type: order_type.as_str().to_string(),
            });
        }
        self.out.trades.append_all(&rows)?;
        Ok(reports)
    }

    /// Bindings trading `symbol` (all bindings for `None`), comma separated.
    fn strategies_for(&self, symbol: Option<&str>) -> String {
        let names: Vec<&str> = self
            .bindings
            .iter()
            .filter(|b| symbol.map(|s| b.symbol == s).unwrap_or(true))
            .map(|b| b.spec.name.as_str())
            .collect();
        names.join(",")
    }

    /// Positions are per symbol and the account is shared, so rows carry the
    /// bindings that own them rather than the strategy being ticked.
    fn update_state_from_broker(&mut self, bar: &Bar) -> Result<(), RunnerError> {
        let account = self.broker.account()?;
        let ts = bar.ts.to_rfc3339();
        let session_id = self.paths.session_id.clone();
        let rows: Vec<PositionRow> = account
            .positions
            .values()
            .map(|p| PositionRow {
                ts: ts.clone(),
                session_id: session_id.clone(),
                symbol: p.symbol.clone(),
                strategy: self.strategies_for(Some(&p.symbol)),
                qty: p.quantity.to_string(),
                avg_price: p.avg_price.to_string(),
                unrealized_pnl: p.unrealized_pnl.to_string(),
            })
            .collect();
        self.out.positions.append_all(&rows)?;
        self.out.account.append(&AccountRow {
            ts,
            session_id,
            symbol: bar.symbol.clone(),
            strategy: self.strategies_for(None),
            cash: account.cash.to_string(),
            equity: account.equity.to_string(),
            buying_power: account.cash.to_string(),
            currency: self.cfg.currency.clone(),
        })?;

        self.state.positions = account.positions.clone();
        self.state.realized_pnl = account.realized_pnl;
        self.state.unrealized_pnl = account.unrealized_pnl;
        self.state.update_equity(account.equity);

        EQUITY.set(f64_of(account.equity));
        PNL_REALIZED.set(f64_of(account.realized_pnl));
        PNL_UNREALIZED.set(f64_of(account.unrealized_pnl));
        DRAWDOWN_BPS.set(f64_of(compute_drawdown_bps(self.state.equity, self.state.peak_equity)));
        Ok(())
    }

    fn emit_loop_metrics(&self, ts: DateTime<Utc>) {
        if let Err(e) = self.out.loop_metrics.append(&self.metrics.snapshot(ts)) {
            warn!(error = %e, "write loop metrics failed");
        }
    }

    fn maybe_snapshot_router(&mut self, when: DateTime<Utc>) {
        if self.cfg.router_snapshot_interval <= Duration::zero() {
            return;
        }
        if let Some(last) = self.last_router_snapshot {
            if when - last < self.cfg.router_snapshot_interval {
                return;
            }
        }
        match self.router.save(&self.paths.router_state_file) {
            Ok(()) => self.last_router_snapshot = Some(when),
            Err(e) => warn!(error = %e, "persist router snapshot failed"),
        }
    }

    fn finish(&mut self, reason: &str) -> Result<RunReport, RunnerError> {
        let stopped = self.clock.now();
        HALTS.with_label_values(&[reason]).inc();
        info!(halt_reason = %reason, loops = self.loops, "runner stopped");

        let mut first_err: Option<RunnerError> = None;
        if let Err(e) = self.event(&RunnerEvent::Halt { reason, ts: stopped }) {
            warn!(error = %e, "write halt event failed");
        }
        if let Err(e) = self.router.save(&self.paths.router_state_file) {
            warn!(error = %e, "persist router snapshot failed");
            first_err.get_or_insert(e.into());
        }
        self.emit_loop_metrics(stopped);
        let snap = self.metrics.snapshot(stopped);

        let peak = if self.state.peak_equity > Decimal::ZERO { self.state.peak_equity } else { self.state.equity };
        let summary = SessionSummary {
            session_id: self.paths.session_id.clone(),
            symbol: self.bindings.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>().join(","),
            strategy: self.bindings.iter().map(|b| b.spec.name.as_str()).collect::<Vec<_>>().join(","),
            started_at: self.started_at.unwrap_or(stopped),
            stopped_at: stopped,
            halt_reason: reason.to_string(),
            final_equity: self.state.equity,
            peak_equity: self.state.peak_equity,
            realized_pnl: self.state.realized_pnl,
            drawdown_bps: compute_drawdown_bps(self.state.equity, peak),
            p95_latency_s: snap.p95_latency_s,
            skip_rate: snap.skip_rate,
        };
        if let Err(e) = session::write_summary(&self.paths.session_report, &summary) {
            warn!(error = %e, "write session summary failed");
            first_err.get_or_insert(e.into());
        }
        if let Err(e) = metrics::export_to_file(&self.paths.metrics_file) {
            warn!(error = %e, "export metrics failed");
            first_err.get_or_insert(e.into());
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(RunReport { summary, loops: self.loops }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{OrderIntent, Side};
    use crate::feed::MemoryFeed;
    use crate::matching::{BrokerConfig, MatchingBroker};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap() }

    fn idle() -> Box<dyn OrderIntentGenerator> { Box::new(|_: &[Bar], _: Decimal| -> Vec<OrderIntent> { Vec::new() }) }

    #[test]
    fn binding_derives_budget_and_heartbeat() {
        let b = StrategyBinding::for_interval("mr", "X", "1m", 0.25, Duration::minutes(5), idle()).unwrap();
        assert_eq!(b.spec.cadence, Duration::minutes(1));
        assert_eq!(b.spec.time_budget, Duration::seconds(15));
        assert_eq!(b.spec.jitter, Duration::minutes(1));
        assert_eq!(b.spec.heartbeat_timeout, Some(Duration::minutes(3)));

        let fast = StrategyBinding::for_interval("f", "X", "1s", 0.01, Duration::zero(), idle()).unwrap();
        assert_eq!(fast.spec.time_budget, Duration::milliseconds(50));
        assert!(StrategyBinding::for_interval("bad", "X", "soon", 0.25, Duration::zero(), idle()).is_err());
    }

    #[tokio::test]
    async fn buys_once_then_halts_on_empty_feed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = session::create_session(dir.path(), "unit").unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let mut feed = MemoryFeed::new();
        feed.push(Bar { ts: t0(), open: dec!(100), high: dec!(100), low: dec!(100), close: dec!(100), volume: dec!(10), symbol: "X".into() });
        let broker = MatchingBroker::new(BrokerConfig::default(), clock.clone());
        let gen = |bars: &[Bar], qty: Decimal| -> Vec<OrderIntent> {
            if !qty.is_zero() {
                return Vec::new();
            }
            bars.iter().map(|b| OrderIntent::market(b.symbol.clone(), Side::Buy, dec!(2))).collect()
        };
        let binding = StrategyBinding::for_interval("mr", "X", "1m", 0.25, Duration::zero(), Box::new(gen)).unwrap();
        let mut runner =
            RunnerLoop::new(RunnerConfig::default(), RiskLimits::default(), paths.clone(), broker, feed, clock, vec![binding]).unwrap();

        let report = runner.run().await.unwrap();
        assert_eq!(report.summary.halt_reason, HALT_NO_NEW_BARS);
        assert_eq!(report.loops, 1);
        assert_eq!(runner.broker().position_qty("X"), dec!(2));
        assert!(runner.state().open_orders.is_empty());
        assert!(runner.router().pending_orders().is_empty());
        assert_eq!(runner.state().consecutive_rejects, 0);
        assert_eq!(runner.state().positions["X"].quantity, dec!(2));
        assert!(paths.trades_file.exists());
        assert!(paths.session_report.exists());
    }
}
