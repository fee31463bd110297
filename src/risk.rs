// ===============================
// src/risk.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : risk.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Pre-trade limits + circuit breakers. Semua fungsi di sini murni: input
// (RiskLimits, RiskContext) -> Decision, tanpa efek samping kecuali cek
// keberadaan file kill-switch.
//
// Nilai limit 0 artinya check dimatikan.
//
use std::path::PathBuf;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_notional: Decimal,
    pub max_position: Decimal,
    pub symbol_position_limits: HashMap<String, Decimal>,
    pub max_drawdown_bps: Decimal,
    pub max_consecutive_rejects: u32,
    pub stale_data_threshold_s: i64,
    pub kill_switch_file: Option<PathBuf>,

    // portfolio overlays
    pub portfolio_gross_cap: Decimal,
    pub per_asset_cap: Decimal,
    pub asset_class_caps: HashMap<String, Decimal>,
    pub per_trade_risk_cap: Decimal,
    pub portfolio_drawdown_cap: Decimal,
    pub cooldown_days: u32,
    pub daily_portfolio_loss_cap: Decimal,
    pub daily_strategy_loss_cap: Decimal,
    pub capacity_warn_participation: Decimal,
    pub capacity_max_participation: Decimal,
    pub adv_lookback_days: usize,
    pub turnover_warn: Decimal,
    pub turnover_block: Decimal,
    pub symbol_asset_class: HashMap<String, String>,
    pub default_asset_class: String,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_notional: Decimal::ZERO,
            max_position: Decimal::ZERO,
            symbol_position_limits: HashMap::new(),
            max_drawdown_bps: Decimal::ZERO,
            max_consecutive_rejects: 5,
            stale_data_threshold_s: 300,
            kill_switch_file: None,
            portfolio_gross_cap: Decimal::ZERO,
            per_asset_cap: Decimal::ZERO,
            asset_class_caps: HashMap::new(),
            per_trade_risk_cap: Decimal::ZERO,
            portfolio_drawdown_cap: Decimal::ZERO,
            cooldown_days: 0,
            daily_portfolio_loss_cap: Decimal::ZERO,
            daily_strategy_loss_cap: Decimal::ZERO,
            capacity_warn_participation: Decimal::ZERO,
            capacity_max_participation: Decimal::ZERO,
            adv_lookback_days: 20,
            turnover_warn: Decimal::ZERO,
            turnover_block: Decimal::ZERO,
            symbol_asset_class: HashMap::new(),
            default_asset_class: "equity".to_string(),
        }
    }
}

impl RiskLimits {
    fn has_portfolio_limits(&self) -> bool {
        [
            self.portfolio_gross_cap,
            self.per_asset_cap,
            self.per_trade_risk_cap,
            self.portfolio_drawdown_cap,
            self.daily_portfolio_loss_cap,
            self.daily_strategy_loss_cap,
            self.capacity_warn_participation,
            self.capacity_max_participation,
            self.turnover_warn,
            self.turnover_block,
        ]
        .iter()
        .any(|v| *v > Decimal::ZERO)
            || !self.asset_class_caps.is_empty()
    }

    pub fn asset_class_of(&self, symbol: &str) -> String {
        self.symbol_asset_class
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.default_asset_class.clone())
            .to_ascii_lowercase()
    }

    fn class_cap(&self, asset_class: &str) -> Decimal {
        self.asset_class_caps
            .get(&asset_class.to_ascii_lowercase())
            .or_else(|| self.asset_class_caps.get(&asset_class.to_ascii_uppercase()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Exposures are fractions of NAV; losses are signed fractions (negative = loss).
#[derive(Debug, Clone, Default)]
pub struct PortfolioContext {
    pub strategy_id: String,
    pub asset_class: String,
    pub gross_exposure: Decimal,
    pub projected_gross_exposure: Decimal,
    pub symbol_exposure: Decimal,
    pub projected_symbol_exposure: Decimal,
    pub class_exposure: Decimal,
    pub projected_class_exposure: Decimal,
    pub portfolio_drawdown: Decimal,
    pub daily_portfolio_loss: Decimal,
    pub strategy_daily_loss: Decimal,
    pub cooldown_active: bool,
    pub projected_turnover: Decimal,
    pub order_participation: Decimal,
    pub reducing: bool,
}

#[derive(Debug, Clone)]
pub struct RiskContext {
    pub equity: Decimal,
    pub position_quantity: Decimal,
    pub realized_drawdown_bps: Decimal,
    pub consecutive_rejects: u32,
    pub last_bar_ts: DateTime<Utc>,
    pub now_ts: DateTime<Utc>,
    pub portfolio: PortfolioContext,
}

impl RiskContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            equity: Decimal::ZERO,
            position_quantity: Decimal::ZERO,
            realized_drawdown_bps: Decimal::ZERO,
            consecutive_rejects: 0,
            last_bar_ts: now,
            now_ts: now,
            portfolio: PortfolioContext::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: &'static str,
    pub warnings: Vec<&'static str>,
}

impl Decision {
    pub fn allow() -> Self { Self { allowed: true, reason: "", warnings: Vec::new() } }
    pub fn reject(reason: &'static str) -> Self { Self { allowed: false, reason, warnings: Vec::new() } }
}

fn over_cap(value: Decimal, cap: Decimal) -> bool { cap > Decimal::ZERO && value > cap }

/// Sizing limits for one proposed order. `quantity` is signed.
pub fn check_order_limits(
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
    limits: &RiskLimits,
    ctx: &RiskContext,
) -> Decision {
    let notional = (quantity * price).abs();
    if over_cap(notional, limits.max_notional) {
        return Decision::reject("max_notional_exceeded");
    }

    let pos_limit = limits.symbol_position_limits.get(symbol).copied().unwrap_or(limits.max_position);
    if over_cap((ctx.position_quantity + quantity).abs(), pos_limit) {
        return Decision::reject("max_position_exceeded");
    }

    if !limits.has_portfolio_limits() {
        return Decision::allow();
    }
    check_portfolio_limits(notional, limits, ctx)
}

fn check_portfolio_limits(order_notional: Decimal, limits: &RiskLimits, ctx: &RiskContext) -> Decision {
    let p = &ctx.portfolio;

    if p.cooldown_active {
        return Decision::reject("cooldown_active");
    }
    if limits.portfolio_drawdown_cap > Decimal::ZERO && p.portfolio_drawdown >= limits.portfolio_drawdown_cap {
        return Decision::reject("portfolio_drawdown_cap");
    }
    if limits.daily_portfolio_loss_cap > Decimal::ZERO && p.daily_portfolio_loss <= -limits.daily_portfolio_loss_cap {
        return Decision::reject("daily_portfolio_loss_cap");
    }
    if limits.daily_strategy_loss_cap > Decimal::ZERO && p.strategy_daily_loss <= -limits.daily_strategy_loss_cap {
        return Decision::reject("strategy_daily_loss_cap");
    }
    if limits.per_trade_risk_cap > Decimal::ZERO
        && ctx.equity > Decimal::ZERO
        && !p.reducing
        && order_notional / ctx.equity > limits.per_trade_risk_cap
    {
        return Decision::reject("per_trade_risk_cap");
    }

    // caps only block orders that add exposure; reductions pass
    if over_cap(p.projected_gross_exposure, limits.portfolio_gross_cap)
        && p.projected_gross_exposure > p.gross_exposure
    {
        return Decision::reject("portfolio_gross_cap");
    }
    if over_cap(p.projected_symbol_exposure, limits.per_asset_cap)
        && p.projected_symbol_exposure > p.symbol_exposure
    {
        return Decision::reject("per_asset_cap");
    }
    let asset_class = if p.asset_class.is_empty() { limits.default_asset_class.as_str() } else { p.asset_class.as_str() };
    if over_cap(p.projected_class_exposure, limits.class_cap(asset_class))
        && p.projected_class_exposure > p.class_exposure
    {
        return Decision::reject("asset_class_cap");
    }

    if over_cap(p.projected_turnover, limits.turnover_block) {
        return Decision::reject("turnover_block");
    }
    if over_cap(p.order_participation, limits.capacity_max_participation) {
        return Decision::reject("capacity_limit");
    }

    let mut decision = Decision::allow();
    if over_cap(p.projected_turnover, limits.turnover_warn) {
        decision.warnings.push("turnover_warn");
    }
    if over_cap(p.order_participation, limits.capacity_warn_participation) {
        decision.warnings.push("capacity_warn");
    }
    decision
}

pub fn check_session_drawdown(limits: &RiskLimits, ctx: &RiskContext) -> Decision {
    if limits.max_drawdown_bps > Decimal::ZERO && ctx.realized_drawdown_bps <= -limits.max_drawdown_bps.abs() {
        return Decision::reject("drawdown_limit_reached");
    }
    Decision::allow()
}

/// Global stop conditions, first failure wins:
/// kill switch -> drawdown -> consecutive rejects -> stale data.
pub fn check_circuit_breakers(limits: &RiskLimits, ctx: &RiskContext) -> Decision {
    if limits.kill_switch_file.as_ref().map(|p| p.exists()).unwrap_or(false) {
        return Decision::reject("kill_switch_triggered");
    }
    let dd = check_session_drawdown(limits, ctx);
    if !dd.allowed {
        return dd;
    }
    if limits.max_consecutive_rejects > 0 && ctx.consecutive_rejects >= limits.max_consecutive_rejects {
        return Decision::reject("reject_limit_reached");
    }
    if limits.stale_data_threshold_s > 0 {
        let age_ms = (ctx.now_ts - ctx.last_bar_ts).num_milliseconds();
        if age_ms > limits.stale_data_threshold_s * 1000 {
            return Decision::reject("data_stale");
        }
    }
    Decision::allow()
}

/// Drawdown vs peak in bps (negative when under water).
pub fn compute_drawdown_bps(equity: Decimal, peak_equity: Decimal) -> Decimal {
    if peak_equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (equity - peak_equity) / peak_equity * dec!(10000)
}

pub fn compute_adv_notional<I: IntoIterator<Item = Decimal>>(observations: I) -> Decimal {
    let (sum, n) = observations.into_iter().fold((Decimal::ZERO, 0u32), |(s, n), v| (s + v, n + 1));
    if n == 0 { Decimal::ZERO } else { sum / Decimal::from(n) }
}

pub fn compute_participation(order_notional: Decimal, adv_notional: Decimal) -> Decimal {
    if adv_notional <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    order_notional.abs() / adv_notional
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> RiskContext {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        RiskContext { equity: dec!(100000), ..RiskContext::new(now) }
    }

    #[test]
    fn zero_limits_disable_sizing_checks() {
        let d = check_order_limits("BTC", dec!(1000), dec!(50000), &RiskLimits::default(), &ctx());
        assert!(d.allowed);
    }

    #[test]
    fn notional_cap_is_strict() {
        let limits = RiskLimits { max_notional: dec!(1000), ..Default::default() };
        assert!(check_order_limits("X", dec!(10), dec!(100), &limits, &ctx()).allowed);
        let d = check_order_limits("X", dec!(-10.01), dec!(100), &limits, &ctx());
        assert_eq!(d.reason, "max_notional_exceeded");
    }

    #[test]
    fn position_cap_uses_symbol_override() {
        let mut limits = RiskLimits { max_position: dec!(5), ..Default::default() };
        let mut c = ctx();
        c.position_quantity = dec!(4);
        assert_eq!(check_order_limits("X", dec!(2), dec!(1), &limits, &c).reason, "max_position_exceeded");
        assert!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).allowed);
        // selling through zero is measured on the absolute projection
        assert!(check_order_limits("X", dec!(-9), dec!(1), &limits, &c).allowed);

        limits.symbol_position_limits.insert("X".into(), dec!(10));
        assert!(check_order_limits("X", dec!(2), dec!(1), &limits, &c).allowed);
    }

    #[test]
    fn gross_cap_blocks_increase_but_not_reduction() {
        let limits = RiskLimits { portfolio_gross_cap: dec!(1.0), ..Default::default() };
        let mut c = ctx();
        c.portfolio.gross_exposure = dec!(0.9);
        c.portfolio.projected_gross_exposure = dec!(1.2);
        assert_eq!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).reason, "portfolio_gross_cap");

        c.portfolio.gross_exposure = dec!(1.5);
        c.portfolio.projected_gross_exposure = dec!(1.2);
        assert!(check_order_limits("X", dec!(-1), dec!(1), &limits, &c).allowed);
    }

    #[test]
    fn portfolio_checks_run_in_fixed_order() {
        let limits = RiskLimits {
            portfolio_drawdown_cap: dec!(0.1),
            turnover_block: dec!(2),
            ..Default::default()
        };
        let mut c = ctx();
        c.portfolio.cooldown_active = true;
        c.portfolio.portfolio_drawdown = dec!(0.2);
        c.portfolio.projected_turnover = dec!(3);
        assert_eq!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).reason, "cooldown_active");
        c.portfolio.cooldown_active = false;
        assert_eq!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).reason, "portfolio_drawdown_cap");
        c.portfolio.portfolio_drawdown = Decimal::ZERO;
        assert_eq!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).reason, "turnover_block");
    }

    #[test]
    fn warnings_do_not_block() {
        let limits = RiskLimits {
            turnover_warn: dec!(0.5),
            capacity_warn_participation: dec!(0.03),
            capacity_max_participation: dec!(0.05),
            ..Default::default()
        };
        let mut c = ctx();
        c.portfolio.projected_turnover = dec!(0.6);
        c.portfolio.order_participation = dec!(0.04);
        let d = check_order_limits("X", dec!(1), dec!(1), &limits, &c);
        assert!(d.allowed);
        assert_eq!(d.warnings, vec!["turnover_warn", "capacity_warn"]);

        c.portfolio.order_participation = dec!(0.06);
        assert_eq!(check_order_limits("X", dec!(1), dec!(1), &limits, &c).reason, "capacity_limit");
    }

    #[test]
    fn per_trade_cap_skipped_when_reducing() {
        let limits = RiskLimits { per_trade_risk_cap: dec!(0.01), ..Default::default() };
        let mut c = ctx();
        assert_eq!(check_order_limits("X", dec!(20), dec!(100), &limits, &c).reason, "per_trade_risk_cap");
        c.portfolio.reducing = true;
        assert!(check_order_limits("X", dec!(-20), dec!(100), &limits, &c).allowed);
    }

    #[test]
    fn kill_switch_wins_over_drawdown() {
        let dir = tempfile::tempdir().unwrap();
        let kill = dir.path().join("KILL");
        std::fs::write(&kill, b"stop").unwrap();
        let limits = RiskLimits {
            kill_switch_file: Some(kill),
            max_drawdown_bps: dec!(100),
            ..Default::default()
        };
        let mut c = ctx();
        c.realized_drawdown_bps = dec!(-500);
        assert_eq!(check_circuit_breakers(&limits, &c).reason, "kill_switch_triggered");
    }

    #[test]
    fn missing_kill_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let limits = RiskLimits { kill_switch_file: Some(dir.path().join("absent")), ..Default::default() };
        assert!(check_circuit_breakers(&limits, &ctx()).allowed);
    }

    #[test]
    fn drawdown_trips_at_threshold() {
        let limits = RiskLimits { max_drawdown_bps: dec!(200), ..Default::default() };
        let mut c = ctx();
        c.realized_drawdown_bps = dec!(-199.99);
        assert!(check_circuit_breakers(&limits, &c).allowed);
        c.realized_drawdown_bps = dec!(-200);
        assert_eq!(check_circuit_breakers(&limits, &c).reason, "drawdown_limit_reached");
    }

    #[test]
    fn reject_limit_and_staleness() {
        let limits = RiskLimits { max_consecutive_rejects: 3, stale_data_threshold_s: 60, ..Default::default() };
        let mut c = ctx();
        c.consecutive_rejects = 3;
        assert_eq!(check_circuit_breakers(&limits, &c).reason, "reject_limit_reached");

        c.consecutive_rejects = 0;
        c.last_bar_ts = c.now_ts - chrono::Duration::seconds(60);
        assert!(check_circuit_breakers(&limits, &c).allowed);
        c.last_bar_ts = c.now_ts - chrono::Duration::milliseconds(60_001);
        assert_eq!(check_circuit_breakers(&limits, &c).reason, "data_stale");
    }

    #[test]
    fn drawdown_and_capacity_helpers() {
        assert_eq!(compute_drawdown_bps(dec!(95), dec!(100)), dec!(-500));
        assert_eq!(compute_drawdown_bps(dec!(95), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(compute_adv_notional(vec![dec!(10), dec!(20)]), dec!(15));
        assert_eq!(compute_adv_notional(Vec::new()), Decimal::ZERO);
        assert_eq!(compute_participation(dec!(-5), dec!(100)), dec!(0.05));
        assert_eq!(compute_participation(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }
}
