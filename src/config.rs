// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : config.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Konfigurasi dari .env / environment (dotenvy), lalu CLI (clap) menimpa
// beberapa nilai. Semua angka uang/qty dibaca sebagai Decimal.
//
// Contoh .env:
//   SYMBOL=BTCUSDT
//   STRATEGY=mean_reversion
//   INTERVAL=1m
//   FEED=mock | csv        (CSV_PATH=bars.csv)
//   MOCK_START_PRICE=100
//   VENUE=paper | <nama>   (selain paper -> UnsupportedBroker)
//   MAX_LOOPS=100
//   RUNS_DIR=runs
//   RISK_MAX_NOTIONAL=50000
//   RISK_SYMBOL_POSITION_LIMITS=BTCUSDT:2,ETHUSDT:20
//   RISK_ASSET_CLASS_CAPS=crypto:0.5
//   ROUTER_RATE_LIMIT=5
//   SCHED_BUDGET_FRACTION=0.25
//   BROKER_TAKER_FEE_BPS=7.5
//
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::matching::BrokerConfig;
use crate::risk::RiskLimits;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Csv(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Paper,
    Unsupported(String),
}

impl VenueMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "paper" | "sim" | "mock" => VenueMode::Paper,
            other => VenueMode::Unsupported(other.to_string()),
        }
    }
}

// ===== Strategi =====
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    MeanReversion,
    Hold,
}

impl StrategyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean_reversion" | "meanreversion" | "mr" => Some(StrategyMode::MeanReversion),
            "hold" | "noop" | "flat" => Some(StrategyMode::Hold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::MeanReversion => "mean_reversion",
            StrategyMode::Hold => "hold",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MeanReversionParams {
    pub window: usize,
    pub edge_bps: Decimal,
    pub trade_qty: Decimal,
    pub max_position: Decimal,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub symbol: String,
    pub strategy: StrategyMode,
    pub interval: String,
    pub max_loops: Option<u64>,
    pub runs_dir: PathBuf,
    /// Reuse an existing session dir (resume) instead of minting a new id.
    pub session_id: Option<String>,
    pub feed: FeedMode,
    /// First open for the mock random walk.
    pub mock_start_price: Decimal,
    pub venue: VenueMode,
    pub seed: Option<u64>,
    pub currency: String,

    // scheduler
    pub budget_fraction: f64,
    pub jitter_s: f64,

    // router
    pub router_rate_limit: u32,
    pub router_max_inflight: u32,
    pub router_snapshot_s: i64,
    pub metrics_window: usize,

    pub broker: BrokerConfig,
    pub limits: RiskLimits,
    pub mean_reversion: MeanReversionParams,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            strategy: StrategyMode::MeanReversion,
            interval: "1m".to_string(),
            max_loops: None,
            runs_dir: PathBuf::from("runs"),
            session_id: None,
            feed: FeedMode::Mock,
            mock_start_price: dec!(100),
            venue: VenueMode::Paper,
            seed: None,
            currency: "USD".to_string(),
            budget_fraction: 0.25,
            jitter_s: 0.0,
            router_rate_limit: 5,
            router_max_inflight: 256,
            router_snapshot_s: 30,
            metrics_window: 512,
            broker: BrokerConfig::default(),
            limits: RiskLimits::default(),
            mean_reversion: MeanReversionParams {
                window: 20,
                edge_bps: dec!(25),
                trade_qty: dec!(1),
                max_position: dec!(5),
            },
        }
    }
}

// ---- helpers ----

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> { env::var(key).ok().and_then(|s| s.trim().parse().ok()) }

/// "BTC:2, ETH:10" -> {BTC: 2, ETH: 10}. Bad pairs are skipped with a warning.
pub fn parse_decimal_map(raw: &str) -> HashMap<String, Decimal> {
    let mut out = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once(':') {
            Some((k, v)) => match Decimal::from_str(v.trim()) {
                Ok(d) => {
                    out.insert(k.trim().to_string(), d);
                }
                Err(_) => warn!(%pair, "skip bad decimal map entry"),
            },
            None => warn!(%pair, "skip map entry without ':'"),
        }
    }
    out
}

/// "BTCUSDT:crypto,SPY:equity" -> {BTCUSDT: crypto, SPY: equity}
pub fn parse_string_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|p| p.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_ascii_lowercase()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

fn env_decimal(key: &str, default: Decimal) -> Decimal { env_or(key, default) }

fn load_limits() -> RiskLimits {
    let d = RiskLimits::default();
    RiskLimits {
        max_notional: env_decimal("RISK_MAX_NOTIONAL", d.max_notional),
        max_position: env_decimal("RISK_MAX_POSITION", d.max_position),
        symbol_position_limits: env::var("RISK_SYMBOL_POSITION_LIMITS").map(|s| parse_decimal_map(&s)).unwrap_or_default(),
        max_drawdown_bps: env_decimal("RISK_MAX_DRAWDOWN_BPS", d.max_drawdown_bps),
        max_consecutive_rejects: env_or("RISK_MAX_CONSECUTIVE_REJECTS", d.max_consecutive_rejects),
        stale_data_threshold_s: env_or("RISK_STALE_DATA_THRESHOLD_S", d.stale_data_threshold_s),
        kill_switch_file: env::var("RISK_KILL_SWITCH_FILE").ok().filter(|s| !s.trim().is_empty()).map(PathBuf::from),
        portfolio_gross_cap: env_decimal("RISK_PORTFOLIO_GROSS_CAP", d.portfolio_gross_cap),
        per_asset_cap: env_decimal("RISK_PER_ASSET_CAP", d.per_asset_cap),
        asset_class_caps: env::var("RISK_ASSET_CLASS_CAPS")
            .map(|s| parse_decimal_map(&s).into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect())
            .unwrap_or_default(),
        per_trade_risk_cap: env_decimal("RISK_PER_TRADE_CAP", d.per_trade_risk_cap),
        portfolio_drawdown_cap: env_decimal("RISK_PORTFOLIO_DRAWDOWN_CAP", d.portfolio_drawdown_cap),
        cooldown_days: env_or("RISK_COOLDOWN_DAYS", d.cooldown_days),
        daily_portfolio_loss_cap: env_decimal("RISK_DAILY_PORTFOLIO_LOSS_CAP", d.daily_portfolio_loss_cap),
        daily_strategy_loss_cap: env_decimal("RISK_DAILY_STRATEGY_LOSS_CAP", d.daily_strategy_loss_cap),
        capacity_warn_participation: env_decimal("RISK_CAPACITY_WARN", d.capacity_warn_participation),
        capacity_max_participation: env_decimal("RISK_CAPACITY_MAX", d.capacity_max_participation),
        adv_lookback_days: env_or("RISK_ADV_LOOKBACK", d.adv_lookback_days),
        turnover_warn: env_decimal("RISK_TURNOVER_WARN", d.turnover_warn),
        turnover_block: env_decimal("RISK_TURNOVER_BLOCK", d.turnover_block),
        symbol_asset_class: env::var("RISK_SYMBOL_ASSET_CLASS").map(|s| parse_string_map(&s)).unwrap_or_default(),
        default_asset_class: env::var("RISK_DEFAULT_ASSET_CLASS").unwrap_or(d.default_asset_class),
    }
}

pub fn load() -> AppConfig {
    // Pastikan .env dibaca
    let _ = dotenv();
    let d = AppConfig::default();

    // ===== Basic =====
    let symbol = env::var("SYMBOL").unwrap_or(d.symbol).trim().to_ascii_uppercase();
    let strategy = env::var("STRATEGY")
        .ok()
        .and_then(|s| {
            let parsed = StrategyMode::parse_one(&s);
            if parsed.is_none() {
                warn!(strategy = %s, "unknown STRATEGY, falling back to mean_reversion");
            }
            parsed
        })
        .unwrap_or(d.strategy);
    let session_id = env::var("SESSION_ID").ok().filter(|s| !s.trim().is_empty());

    // ===== Mode =====
    let feed = match env::var("FEED").unwrap_or_default().to_ascii_lowercase().as_str() {
        "csv" => FeedMode::Csv(PathBuf::from(env::var("CSV_PATH").unwrap_or_else(|_| "bars.csv".to_string()))),
        _ => FeedMode::Mock,
    };
    let venue = VenueMode::parse(&env::var("VENUE").unwrap_or_default());

    // ===== Broker =====
    let bd = d.broker;
    let broker = BrokerConfig {
        starting_cash: env_decimal("BROKER_STARTING_CASH", bd.starting_cash),
        slippage_bps: env_decimal("BROKER_SLIPPAGE_BPS", bd.slippage_bps),
        maker_fee_bps: env_decimal("BROKER_MAKER_FEE_BPS", bd.maker_fee_bps),
        taker_fee_bps: env_decimal("BROKER_TAKER_FEE_BPS", bd.taker_fee_bps),
    };

    let mr = d.mean_reversion;
    AppConfig {
        symbol,
        strategy,
        interval: env::var("INTERVAL").unwrap_or(d.interval),
        max_loops: env_opt("MAX_LOOPS"),
        runs_dir: env::var("RUNS_DIR").map(PathBuf::from).unwrap_or(d.runs_dir),
        session_id,
        feed,
        mock_start_price: env_decimal("MOCK_START_PRICE", d.mock_start_price),
        venue,
        seed: env_opt("SEED"),
        currency: env::var("CURRENCY").unwrap_or(d.currency),
        budget_fraction: env_or("SCHED_BUDGET_FRACTION", d.budget_fraction),
        jitter_s: env_or("SCHED_JITTER_S", d.jitter_s),
        router_rate_limit: env_or("ROUTER_RATE_LIMIT", d.router_rate_limit),
        router_max_inflight: env_or("ROUTER_MAX_INFLIGHT", d.router_max_inflight),
        router_snapshot_s: env_or("ROUTER_SNAPSHOT_INTERVAL_S", d.router_snapshot_s),
        metrics_window: env_or("METRICS_WINDOW", d.metrics_window),
        broker,
        limits: load_limits(),
        mean_reversion: MeanReversionParams {
            window: env_or("MR_WINDOW", mr.window),
            edge_bps: env_decimal("MR_EDGE_BPS", mr.edge_bps),
            trade_qty: env_decimal("MR_TRADE_QTY", mr.trade_qty),
            max_position: env_decimal("MR_MAX_POSITION", mr.max_position),
        },
    }
}

/// Command-line overrides; anything left out keeps the env value.
#[derive(Parser, Debug, Default)]
#[command(name = "runner_core_rust", about = "Scheduled strategy runner with paper execution")]
pub struct Cli {
    #[arg(long)]
    pub symbol: Option<String>,
    #[arg(long)]
    pub strategy: Option<String>,
    #[arg(long)]
    pub interval: Option<String>,
    #[arg(long)]
    pub max_loops: Option<u64>,
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
    /// Resume an existing session id.
    #[arg(long)]
    pub session_id: Option<String>,
    /// Read bars from this CSV instead of the mock feed.
    #[arg(long)]
    pub csv: Option<PathBuf>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub kill_switch_file: Option<PathBuf>,
}

impl Cli {
    pub fn apply(self, cfg: &mut AppConfig) {
        if let Some(s) = self.symbol {
            cfg.symbol = s.trim().to_ascii_uppercase();
        }
        if let Some(s) = self.strategy {
            match StrategyMode::parse_one(&s) {
                Some(m) => cfg.strategy = m,
                None => warn!(strategy = %s, "unknown --strategy ignored"),
            }
        }
        if let Some(i) = self.interval {
            cfg.interval = i;
        }
        if self.max_loops.is_some() {
            cfg.max_loops = self.max_loops;
        }
        if let Some(d) = self.runs_dir {
            cfg.runs_dir = d;
        }
        if self.session_id.is_some() {
            cfg.session_id = self.session_id;
        }
        if let Some(p) = self.csv {
            cfg.feed = FeedMode::Csv(p);
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if self.kill_switch_file.is_some() {
            cfg.limits.kill_switch_file = self.kill_switch_file;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_map_skips_garbage() {
        let m = parse_decimal_map("BTC:2, ETH : 10.5,bogus,SOL:x,");
        assert_eq!(m.len(), 2);
        assert_eq!(m["BTC"], dec!(2));
        assert_eq!(m["ETH"], dec!(10.5));
    }

    #[test]
    fn string_map_lowercases_values() {
        let m = parse_string_map("BTCUSDT:Crypto,SPY:equity,:x,Y:");
        assert_eq!(m.len(), 2);
        assert_eq!(m["BTCUSDT"], "crypto");
    }

    #[test]
    fn strategy_and_venue_names() {
        assert_eq!(StrategyMode::parse_one(" MR "), Some(StrategyMode::MeanReversion));
        assert_eq!(StrategyMode::parse_one("noop"), Some(StrategyMode::Hold));
        assert_eq!(StrategyMode::parse_one("ma_crossover"), None);
        assert_eq!(VenueMode::parse("Paper"), VenueMode::Paper);
        assert_eq!(VenueMode::parse("ib"), VenueMode::Unsupported("ib".into()));
    }

    #[test]
    fn cli_overrides_only_what_is_given() {
        let mut cfg = AppConfig { interval: "5m".into(), max_loops: Some(99), ..AppConfig::default() };
        let cli = Cli::parse_from(["runner_core_rust", "--symbol", "ethusdt", "--max-loops", "3", "--csv", "bars.csv"]);
        cli.apply(&mut cfg);
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.max_loops, Some(3));
        assert_eq!(cfg.feed, FeedMode::Csv(PathBuf::from("bars.csv")));
        assert_eq!(cfg.interval, "5m");
        assert_eq!(cfg.strategy, StrategyMode::MeanReversion);
        assert_eq!(cfg.limits.kill_switch_file, None);

        let mut untouched = AppConfig::default();
        Cli::parse_from(["runner_core_rust"]).apply(&mut untouched);
        assert_eq!(untouched.symbol, "BTCUSDT");
        assert_eq!(untouched.max_loops, None);
    }
}
