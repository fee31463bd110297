// ===============================
// src/session.rs (direktori per sesi + run.log + session.md)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : session.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Layout:
//   <runs_dir>/sessions/<session_id>/
//       state.json  state.jsonl  router_state.json
//       trades.csv  orders.csv  positions.csv  account.csv
//       metrics.prom  metrics.jsonl  session.md
//       logs/run.log
//   <runs_dir>/latest   -> path sesi terakhir (file teks)
//
// run.log dipasang lewat reload handle tracing-subscriber yang di-set di
// main. Tanpa handle (mis. di test) attach_log hanya membuat file-nya.
//
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, reload, Layer, Registry};

use crate::recorder::{atomic_write, PersistError};

pub type DynLayer = Box<dyn Layer<Registry> + Send + Sync>;
pub type LogReloadHandle = reload::Handle<Option<DynLayer>, Registry>;

static LOG_HANDLE: OnceCell<LogReloadHandle> = OnceCell::new();

/// Called once by the binary after the subscriber is installed.
pub fn set_log_reload_handle(handle: LogReloadHandle) {
    if LOG_HANDLE.set(handle).is_err() {
        warn!("log reload handle already set");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPaths {
    pub session_id: String,
    pub base_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub state_file: PathBuf,
    pub state_events_file: PathBuf,
    pub router_state_file: PathBuf,
    pub trades_file: PathBuf,
    pub orders_file: PathBuf,
    pub positions_file: PathBuf,
    pub account_file: PathBuf,
    pub session_report: PathBuf,
    pub metrics_file: PathBuf,
    pub loop_metrics_file: PathBuf,
    pub run_log: PathBuf,
}

impl SessionPaths {
    /// Paths only; nothing is created.
    pub fn at(base_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let base_dir = base_dir.into();
        let logs_dir = base_dir.join("logs");
        Self {
            session_id: session_id.into(),
            state_file: base_dir.join("state.json"),
            state_events_file: base_dir.join("state.jsonl"),
            router_state_file: base_dir.join("router_state.json"),
            trades_file: base_dir.join("trades.csv"),
            orders_file: base_dir.join("orders.csv"),
            positions_file: base_dir.join("positions.csv"),
            account_file: base_dir.join("account.csv"),
            session_report: base_dir.join("session.md"),
            metrics_file: base_dir.join("metrics.prom"),
            loop_metrics_file: base_dir.join("metrics.jsonl"),
            run_log: logs_dir.join("run.log"),
            logs_dir,
            base_dir,
        }
    }
}

/// Lowercase, keep [a-z0-9-], everything else becomes '-'.
pub fn safe_slug(s: &str) -> String {
    let slug: String = s
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "na".to_string() } else { slug }
}

pub fn session_id_for(symbol: &str, strategy: &str, when: DateTime<Utc>) -> String {
    format!("{}_{}_{}", when.format("%Y-%m-%d_%H%M"), safe_slug(symbol), safe_slug(strategy))
}

/// Allocate `<runs_dir>/sessions/<id>/` and point `<runs_dir>/latest` at it.
/// Re-using an existing id keeps whatever is already there (resume).
pub fn create_session(runs_dir: &Path, session_id: &str) -> Result<SessionPaths, PersistError> {
    let paths = SessionPaths::at(runs_dir.join("sessions").join(session_id), session_id);
    fs::create_dir_all(&paths.logs_dir)
        .map_err(|source| PersistError::Io { path: paths.logs_dir.clone(), source })?;
    let pointer = fs::canonicalize(&paths.base_dir).unwrap_or_else(|_| paths.base_dir.clone());
    atomic_write(&runs_dir.join("latest"), pointer.display().to_string().as_bytes())?;
    info!(session_id, dir = %paths.base_dir.display(), "session allocated");
    Ok(paths)
}

// ---------------- run.log ----------------

/// Detaches the session file layer when dropped.
#[must_use = "the session log is detached when the guard is dropped"]
pub struct LogGuard {
    attached: bool,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        if let Some(handle) = LOG_HANDLE.get() {
            if let Err(e) = handle.reload(None) {
                eprintln!("detach session log failed: {e}");
            }
        }
    }
}

pub fn attach_log(path: &Path) -> Result<LogGuard, PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PersistError::Io { path: parent.to_path_buf(), source })?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PersistError::Io { path: path.to_path_buf(), source })?;

    let Some(handle) = LOG_HANDLE.get() else {
        debug!(path = %path.display(), "no reload handle; session log file only");
        return Ok(LogGuard { attached: false });
    };
    let layer: DynLayer = fmt::layer().with_writer(Mutex::new(file)).with_ansi(false).boxed();
    match handle.reload(Some(layer)) {
        Ok(()) => Ok(LogGuard { attached: true }),
        Err(e) => {
            warn!(error = %e, "attach session log failed");
            Ok(LogGuard { attached: false })
        }
    }
}

// ---------------- session.md ----------------

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub halt_reason: String,
    pub final_equity: Decimal,
    pub peak_equity: Decimal,
    pub realized_pnl: Decimal,
    pub drawdown_bps: Decimal,
    pub p95_latency_s: f64,
    pub skip_rate: f64,
}

impl SessionSummary {
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Session {}\n\n", self.session_id));
        out.push_str("## Metadata\n\n");
        out.push_str(&format!("- Symbol: {}\n", self.symbol));
        out.push_str(&format!("- Strategy: {}\n", self.strategy));
        out.push_str(&format!("- Started: {}\n", self.started_at.to_rfc3339()));
        out.push_str(&format!("- Stopped: {}\n", self.stopped_at.to_rfc3339()));
        out.push_str(&format!("- Halt reason: {}\n\n", self.halt_reason));
        out.push_str("## Metrics\n\n");
        out.push_str(&format!("- Final equity: {}\n", self.final_equity.round_dp(2)));
        out.push_str(&format!("- Peak equity: {}\n", self.peak_equity.round_dp(2)));
        out.push_str(&format!("- Realized PnL: {}\n", self.realized_pnl.round_dp(2)));
        out.push_str(&format!("- Drawdown (bps): {}\n", self.drawdown_bps.round_dp(2)));
        out.push_str(&format!("- p95 loop latency (s): {:.4}\n", self.p95_latency_s));
        out.push_str(&format!("- Skip rate: {:.2}%\n", self.skip_rate * 100.0));
        out
    }
}

pub fn write_summary(path: &Path, summary: &SessionSummary) -> Result<(), PersistError> {
    atomic_write(path, summary.to_markdown().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn session_ids_are_slugged() {
        let when = Utc.with_ymd_and_hms(2025, 10, 19, 17, 2, 0).unwrap();
        assert_eq!(session_id_for("BTC/USD", "Mean Rev", when), "2025-10-19_1702_btc-usd_mean-rev");
        assert_eq!(safe_slug("  "), "na");
    }

    #[test]
    fn create_session_lays_out_files_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_session(dir.path(), "s1").unwrap();
        assert!(paths.logs_dir.is_dir());
        assert_eq!(paths.state_file, dir.path().join("sessions/s1/state.json"));
        assert_eq!(paths.run_log, dir.path().join("sessions/s1/logs/run.log"));
        let latest = fs::read_to_string(dir.path().join("latest")).unwrap();
        assert!(latest.ends_with("s1"));

        // no reload handle in unit tests: file still gets created
        let guard = attach_log(&paths.run_log).unwrap();
        assert!(paths.run_log.exists());
        drop(guard);
    }

    #[test]
    fn summary_markdown_has_metadata_and_metrics() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let s = SessionSummary {
            session_id: "s1".into(),
            symbol: "BTC".into(),
            strategy: "mr".into(),
            started_at: t,
            stopped_at: t,
            halt_reason: "max_loops_reached".into(),
            final_equity: dec!(1000.456),
            peak_equity: dec!(1010),
            realized_pnl: dec!(-3.2),
            drawdown_bps: dec!(-94.4),
            p95_latency_s: 0.0123,
            skip_rate: 0.25,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.md");
        write_summary(&path, &s).unwrap();
        let md = fs::read_to_string(&path).unwrap();
        assert!(md.starts_with("# Session s1"));
        assert!(md.contains("- Halt reason: max_loops_reached"));
        assert!(md.contains("- Final equity: 1000.46"));
        assert!(md.contains("- Skip rate: 25.00%"));
    }
}
