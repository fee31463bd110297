// ===============================
// src/main.rs
// ===============================
/*
 # jalankan 50 loop dengan mock feed + paper broker
 MAX_LOOPS=50 INTERVAL=1m cargo run --release

 # replay CSV, lanjutkan sesi yang sudah ada
 cargo run -- --csv bars.csv --session-id 2025-10-19_1702_btcusdt_mean_reversion

 # artefak sesi terakhir
 cat "$(cat runs/latest)/session.md"
*/
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : main.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
use std::sync::Arc;

use chrono::Duration;
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use runner_core_rust::broker::{Broker, UnsupportedBroker};
use runner_core_rust::clock::{SharedClock, SystemClock};
use runner_core_rust::config::{self, AppConfig, Cli, FeedMode, StrategyMode, VenueMode};
use runner_core_rust::domain::{Bar, OrderIntent};
use runner_core_rust::feed::{CsvFeed, DataFeed, MockFeed};
use runner_core_rust::matching::MatchingBroker;
use runner_core_rust::runner::{RunReport, RunnerConfig, RunnerError, RunnerLoop, StrategyBinding};
use runner_core_rust::session::{self, DynLayer, SessionPaths};
use runner_core_rust::strategy::{MeanReversion, OrderIntentGenerator};

fn generator_for(app: &AppConfig) -> Box<dyn OrderIntentGenerator> {
    match app.strategy {
        StrategyMode::MeanReversion => {
            let p = &app.mean_reversion;
            Box::new(MeanReversion::new(p.window, p.edge_bps, p.trade_qty, p.max_position))
        }
        StrategyMode::Hold => Box::new(|_: &[Bar], _: Decimal| -> Vec<OrderIntent> { Vec::new() }),
    }
}

fn runner_config(app: &AppConfig) -> RunnerConfig {
    RunnerConfig {
        max_loops: app.max_loops,
        router_rate_limit: app.router_rate_limit,
        router_max_inflight: app.router_max_inflight,
        metrics_window: app.metrics_window,
        router_snapshot_interval: Duration::seconds(app.router_snapshot_s.max(0)),
        scheduler_seed: app.seed,
        currency: app.currency.clone(),
    }
}

async fn run_session<B: Broker, F: DataFeed>(
    app: &AppConfig,
    paths: SessionPaths,
    broker: B,
    feed: F,
    clock: SharedClock,
) -> Result<RunReport, RunnerError> {
    let jitter = Duration::milliseconds((app.jitter_s.max(0.0) * 1000.0) as i64);
    let binding = StrategyBinding::for_interval(
        app.strategy.as_str(),
        &app.symbol,
        &app.interval,
        app.budget_fraction,
        jitter,
        generator_for(app),
    )?;
    let mut runner =
        RunnerLoop::new(runner_config(app), app.limits.clone(), paths, broker, feed, clock, vec![binding])?;

    // Ctrl-C -> stop_requested (loop keluar dengan rapi, artefak tetap ditulis)
    let stop = runner.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, stopping");
            stop.stop();
        }
    });

    runner.run().await
}

async fn with_feed<B: Broker>(
    app: &AppConfig,
    paths: SessionPaths,
    broker: B,
    clock: SharedClock,
) -> Result<RunReport, RunnerError> {
    match &app.feed {
        FeedMode::Mock => {
            let feed = MockFeed::new(clock.clone(), app.seed.unwrap_or(7)).with_start_price(app.mock_start_price);
            run_session(app, paths, broker, feed, clock).await
        }
        FeedMode::Csv(path) => run_session(app, paths, broker, CsvFeed::new(path.clone()), clock).await,
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    // stdout + slot reload untuk logs/run.log per sesi
    let (session_layer, log_handle) = reload::Layer::new(None::<DynLayer>);
    tracing_subscriber::registry()
        .with(session_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
    session::set_log_reload_handle(log_handle);

    // ---- Load config (env) + CLI overrides ----
    let mut app = config::load();
    Cli::parse().apply(&mut app);

    let clock: SharedClock = Arc::new(SystemClock);
    let session_id = app
        .session_id
        .clone()
        .unwrap_or_else(|| session::session_id_for(&app.symbol, app.strategy.as_str(), clock.now()));
    let paths = match session::create_session(&app.runs_dir, &session_id) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, runs_dir = %app.runs_dir.display(), "cannot allocate session");
            std::process::exit(1);
        }
    };

    info!(
        session_id = %paths.session_id,
        symbol = %app.symbol,
        strategy = app.strategy.as_str(),
        interval = %app.interval,
        feed = ?app.feed,
        venue = ?app.venue,
        max_loops = ?app.max_loops,
        "startup config"
    );

    let result = match &app.venue {
        VenueMode::Paper => {
            let broker = MatchingBroker::new(app.broker.clone(), clock.clone());
            with_feed(&app, paths, broker, clock).await
        }
        VenueMode::Unsupported(name) => with_feed(&app, paths, UnsupportedBroker::new(name.clone()), clock).await,
    };

    match result {
        Ok(report) => {
            let s = &report.summary;
            info!(
                halt_reason = %s.halt_reason,
                loops = report.loops,
                final_equity = %s.final_equity,
                realized_pnl = %s.realized_pnl,
                drawdown_bps = %s.drawdown_bps,
                "session finished"
            );
        }
        Err(e) => {
            error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}
