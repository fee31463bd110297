// ===============================
// src/lib.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : lib.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Runner core: scheduler -> feed -> strategy -> risk -> router -> broker,
// dengan state/artefak per sesi di disk.
//
pub mod broker;
pub mod clock;
pub mod config;
pub mod domain;
pub mod feed;
pub mod matching;
pub mod metrics;
pub mod recorder;
pub mod risk;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod strategy;
