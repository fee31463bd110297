// ===============================
// src/recorder.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : recorder.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Penulis file yang tahan crash:
// - atomic_write : tulis ke temp file di dir yang sama, fsync, lalu rename.
//                  Checkpoint lama tetap utuh kalau proses mati di tengah.
// - JsonlLog     : append satu event per baris, fsync tiap baris.
// - CsvLog       : append row ber-header (trades/orders/positions/account).
//
// Parent directory otomatis dibuat kalau belum ada.
//
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io { path: path.to_path_buf(), source }
}

fn ensure_parent(path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    Ok(())
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| PersistError::Io { path: path.to_path_buf(), source: e.error })?;
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write done");
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    atomic_write(path, &body)
}

/// `Ok(None)` when the file does not exist yet.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistError::Io { path: path.to_path_buf(), source: e }),
    }
}

fn open_append(path: &Path) -> Result<fs::File, PersistError> {
    ensure_parent(path)?;
    OpenOptions::new().create(true).append(true).open(path).map_err(io_err(path))
}

#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn append<T: Serialize>(&self, value: &T) -> Result<(), PersistError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = open_append(&self.path)?;
        file.write_all(&line).map_err(io_err(&self.path))?;
        file.sync_data().map_err(io_err(&self.path))?;
        Ok(())
    }

    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, PersistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::Io { path: self.path.clone(), source: e }),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(PersistError::from))
            .collect()
    }
}

/// Append-only CSV. Header comes from the row struct's field names and is
/// written only when the file is new or empty.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn append<T: Serialize>(&self, row: &T) -> Result<(), PersistError> {
        self.append_all(std::slice::from_ref(row))
    }

    pub fn append_all<T: Serialize>(&self, rows: &[T]) -> Result<(), PersistError> {
        if rows.is_empty() {
            return Ok(());
        }
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = open_append(&self.path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);
        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush().map_err(io_err(&self.path))?;
        Ok(())
    }
}

// ---- row layouts (kolom sesuai urutan field) ----

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub ts: String,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub id: String,
    pub side: String,
    pub qty: String,
    pub price: String,
    pub fees: String,
    pub slip_bps: String,
    pub order_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub ts: String,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub id: String,
    pub side: String,
    pub order_type: String,
    pub qty: String,
    pub limit_price: String,
    pub state: String,
    pub reject_reason: String,
    pub broker_order_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub ts: String,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub qty: String,
    pub avg_price: String,
    pub unrealized_pnl: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountRow {
    pub ts: String,
    pub session_id: String,
    pub symbol: String,
    pub strategy: String,
    pub cash: String,
    pub equity: String,
    pub buying_power: String,
    pub currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ev {
        kind: String,
        n: u32,
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        atomic_write(&path, b"{\"v\":1}").unwrap();
        atomic_write(&path, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");
        // no temp files left next to the target
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Ev> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("events.jsonl"));
        log.append(&Ev { kind: "state".into(), n: 1 }).unwrap();
        log.append(&Ev { kind: "feed_error".into(), n: 2 }).unwrap();
        let all: Vec<Ev> = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].kind, "feed_error");
    }

    #[test]
    fn csv_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = CsvLog::new(dir.path().join("positions.csv"));
        let row = PositionRow {
            ts: "2024-01-01T00:00:00Z".into(),
            session_id: "s1".into(),
            symbol: "BTC".into(),
            strategy: "mr".into(),
            qty: "1".into(),
            avg_price: "100".into(),
            unrealized_pnl: "0".into(),
        };
        log.append(&row).unwrap();
        log.append(&row).unwrap();
        let body = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ts,session_id,symbol,strategy,qty,avg_price,unrealized_pnl");
    }
}
