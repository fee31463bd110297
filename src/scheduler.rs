// ===============================
// src/scheduler.rs (cadence + budget + heartbeat)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : scheduler.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Menentukan KAPAN tiap strategi jalan.
// - next_run = selesai + cadence (+ jitter acak, seeded)
// - overrun (runtime > budget) -> lompati satu cadence: selesai + 2*cadence
// - heartbeat telat kalau now - last > timeout (default 2*cadence)
//
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid strategy spec: {0}")]
    InvalidSpec(String),
    #[error("strategy '{0}' already registered")]
    Duplicate(String),
    #[error("unknown strategy '{0}'")]
    Unknown(String),
    #[error("strategy '{0}' already running")]
    AlreadyRunning(String),
    #[error("strategy '{0}' is not marked running")]
    NotRunning(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategySpec {
    pub name: String,
    pub cadence: Duration,
    pub time_budget: Duration,
    pub jitter: Duration,
    pub heartbeat_timeout: Option<Duration>,
}

impl StrategySpec {
    pub fn new(name: impl Into<String>, cadence: Duration, time_budget: Duration) -> Result<Self, SchedulerError> {
        let name = name.into();
        if cadence <= Duration::zero() {
            return Err(SchedulerError::InvalidSpec(format!("{name}: cadence must be positive")));
        }
        if time_budget <= Duration::zero() {
            return Err(SchedulerError::InvalidSpec(format!("{name}: time_budget must be positive")));
        }
        Ok(Self { name, cadence, time_budget, jitter: Duration::zero(), heartbeat_timeout: None })
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Result<Self, SchedulerError> {
        if jitter < Duration::zero() {
            return Err(SchedulerError::InvalidSpec(format!("{}: jitter must be non-negative", self.name)));
        }
        self.jitter = jitter;
        Ok(self)
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    fn heartbeat_limit(&self) -> Duration { self.heartbeat_timeout.unwrap_or(self.cadence * 2) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyState {
    pub next_run: DateTime<Utc>,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub overruns: u64,
    pub skips: u64,
    pub executions: u64,
    pub total_runtime: Duration,
}

impl StrategyState {
    fn new(next_run: DateTime<Utc>) -> Self {
        Self {
            next_run,
            running: false,
            started_at: None,
            last_run: None,
            last_heartbeat: None,
            overruns: 0,
            skips: 0,
            executions: 0,
            total_runtime: Duration::zero(),
        }
    }

    pub fn average_runtime(&self) -> Option<Duration> {
        if self.executions == 0 {
            return None;
        }
        let n = i64::try_from(self.executions).unwrap_or(i64::MAX);
        let avg = match self.total_runtime.num_microseconds() {
            Some(us) => Duration::microseconds(us / n),
            None => Duration::milliseconds(self.total_runtime.num_milliseconds() / n),
        };
        Some(avg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStats {
    pub next_run: DateTime<Utc>,
    pub running: bool,
    pub executions: u64,
    pub overruns: u64,
    pub skips: u64,
    pub avg_runtime_s: Option<f64>,
}

pub struct Scheduler {
    rng: StdRng,
    specs: BTreeMap<String, StrategySpec>,
    states: BTreeMap<String, StrategyState>,
    now: DateTime<Utc>,
}

impl Scheduler {
    /// `now` anchors registrations; a seed makes jitter reproducible.
    pub fn new(now: DateTime<Utc>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng, specs: BTreeMap::new(), states: BTreeMap::new(), now }
    }

    pub fn register(&mut self, spec: StrategySpec, start_at: Option<DateTime<Utc>>) -> Result<(), SchedulerError> {
        if self.specs.contains_key(&spec.name) {
            return Err(SchedulerError::Duplicate(spec.name));
        }
        let anchor = start_at.unwrap_or(self.now);
        let first = self.apply_jitter(anchor, spec.jitter).max(self.now);
        debug!(strategy = %spec.name, first_run = %first, "strategy registered");
        self.states.insert(spec.name.clone(), StrategyState::new(first));
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn register_many<I: IntoIterator<Item = StrategySpec>>(
        &mut self,
        specs: I,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        for spec in specs {
            self.register(spec, start_at)?;
        }
        Ok(())
    }

    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<(&String, DateTime<Utc>)> = self
            .states
            .iter()
            .filter(|(_, st)| !st.running && st.next_run <= now)
            .map(|(name, st)| (name, st.next_run))
            .collect();
        due.sort_by_key(|(_, next)| *next);
        due.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn mark_start(&mut self, name: &str, when: DateTime<Utc>) -> Result<(), SchedulerError> {
        let st = self.states.get_mut(name).ok_or_else(|| SchedulerError::Unknown(name.to_string()))?;
        if st.running {
            return Err(SchedulerError::AlreadyRunning(name.to_string()));
        }
        st.running = true;
        st.started_at = Some(when);
        Ok(())
    }

    /// Returns `true` when the run blew its time budget (and one cadence was skipped).
    pub fn mark_finish(&mut self, name: &str, when: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let spec = self.specs.get(name).cloned().ok_or_else(|| SchedulerError::Unknown(name.to_string()))?;
        let st = self.states.get_mut(name).ok_or_else(|| SchedulerError::Unknown(name.to_string()))?;
        if !st.running {
            return Err(SchedulerError::NotRunning(name.to_string()));
        }
        let runtime = when - st.started_at.unwrap_or(when);
        st.running = false;
        st.started_at = None;
        st.last_run = Some(when);
        st.executions += 1;
        st.total_runtime = st.total_runtime + runtime;

        let over_budget = runtime > spec.time_budget;
        let mut next = when + spec.cadence;
        if over_budget {
            st.overruns += 1;
            st.skips += 1;
            next = next + spec.cadence;
            warn!(strategy = %name, runtime_ms = runtime.num_milliseconds(), budget_ms = spec.time_budget.num_milliseconds(), "time budget overrun, skipping one cadence");
        }
        let next = self.apply_jitter(next, spec.jitter);
        if let Some(st) = self.states.get_mut(name) {
            st.next_run = next;
        }
        Ok(over_budget)
    }

    pub fn record_heartbeat(&mut self, name: &str, when: DateTime<Utc>) -> Result<(), SchedulerError> {
        let st = self.states.get_mut(name).ok_or_else(|| SchedulerError::Unknown(name.to_string()))?;
        st.last_heartbeat = Some(when);
        Ok(())
    }

    pub fn late_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
        self.specs
            .iter()
            .filter(|(name, spec)| match self.states.get(*name).and_then(|s| s.last_heartbeat) {
                Some(last) => now - last > spec.heartbeat_limit(),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Watchdog view only; nothing is stopped.
    pub fn running_over_budget(&self, now: DateTime<Utc>) -> Vec<String> {
        self.specs
            .iter()
            .filter(|(name, spec)| {
                self.states
                    .get(*name)
                    .and_then(|s| if s.running { s.started_at } else { None })
                    .map(|started| now - started > spec.time_budget)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<String, StrategyStats> {
        self.states
            .iter()
            .map(|(name, st)| {
                let avg = st.average_runtime().and_then(|d| d.num_microseconds()).map(|us| us as f64 / 1e6);
                (
                    name.clone(),
                    StrategyStats {
                        next_run: st.next_run,
                        running: st.running,
                        executions: st.executions,
                        overruns: st.overruns,
                        skips: st.skips,
                        avg_runtime_s: avg,
                    },
                )
            })
            .collect()
    }

    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> { self.states.get(name).map(|s| s.next_run) }

    /// Earliest next_run among idle strategies.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.states.values().filter(|s| !s.running).map(|s| s.next_run).min()
    }

    pub fn state(&self, name: &str) -> Option<&StrategyState> { self.states.get(name) }

    fn apply_jitter(&mut self, anchor: DateTime<Utc>, jitter: Duration) -> DateTime<Utc> {
        let ms = jitter.num_milliseconds();
        if ms <= 0 {
            return anchor;
        }
        anchor + Duration::milliseconds(self.rng.gen_range(-ms..=ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 2, 5, 9, 0, 0).unwrap() }

    fn spec(name: &str, cadence_s: i64, budget_s: i64) -> StrategySpec {
        StrategySpec::new(name, Duration::seconds(cadence_s), Duration::seconds(budget_s)).unwrap()
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("a", 60, 5), None).unwrap();
        assert_eq!(s.register(spec("a", 60, 5), None), Err(SchedulerError::Duplicate("a".into())));
    }

    #[test]
    fn due_is_ordered_by_next_run() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("late", 60, 5), Some(t0() + Duration::seconds(30))).unwrap();
        s.register(spec("early", 60, 5), Some(t0() + Duration::seconds(10))).unwrap();
        assert!(s.due(t0()).is_empty());
        assert_eq!(s.due(t0() + Duration::seconds(31)), vec!["early".to_string(), "late".to_string()]);
        assert_eq!(s.next_due(), Some(t0() + Duration::seconds(10)));
    }

    #[test]
    fn start_in_the_past_is_clamped() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("a", 60, 5), Some(t0() - Duration::hours(1))).unwrap();
        assert_eq!(s.next_run("a"), Some(t0()));
    }

    #[test]
    fn overrun_skips_one_cadence() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("a", 60, 5), None).unwrap();
        s.mark_start("a", t0()).unwrap();
        assert_eq!(s.mark_start("a", t0()), Err(SchedulerError::AlreadyRunning("a".into())));
        assert!(s.due(t0()).is_empty());

        let end = t0() + Duration::seconds(10);
        assert!(s.mark_finish("a", end).unwrap());
        assert_eq!(s.next_run("a"), Some(end + Duration::seconds(120)));
        let st = s.state("a").unwrap();
        assert_eq!((st.overruns, st.skips, st.executions), (1, 1, 1));

        assert_eq!(s.mark_finish("a", end), Err(SchedulerError::NotRunning("a".into())));
    }

    #[test]
    fn on_time_run_advances_one_cadence() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("a", 60, 5), None).unwrap();
        s.mark_start("a", t0()).unwrap();
        let end = t0() + Duration::seconds(2);
        assert!(!s.mark_finish("a", end).unwrap());
        assert_eq!(s.next_run("a"), Some(end + Duration::seconds(60)));
        let stats = s.stats();
        assert_eq!(stats["a"].avg_runtime_s, Some(2.0));
    }

    #[test]
    fn average_runtime_survives_huge_execution_counts() {
        let mut st = StrategyState::new(t0());
        assert_eq!(st.average_runtime(), None);
        st.executions = 3_000_000_000;
        st.total_runtime = Duration::seconds(6_000_000_000);
        assert_eq!(st.average_runtime(), Some(Duration::seconds(2)));
    }

    #[test]
    fn jitter_is_seeded_and_bounded() {
        let jittered = || spec("a", 60, 5).with_jitter(Duration::seconds(5)).unwrap();
        let run = |seed| {
            let mut s = Scheduler::new(t0(), Some(seed));
            s.register(jittered(), Some(t0() + Duration::seconds(30))).unwrap();
            s.next_run("a").unwrap()
        };
        assert_eq!(run(42), run(42));
        let first = run(7);
        assert!(first >= t0() + Duration::seconds(25) && first <= t0() + Duration::seconds(35));
    }

    #[test]
    fn heartbeats_and_watchdog() {
        let mut s = Scheduler::new(t0(), Some(1));
        s.register(spec("a", 10, 5), None).unwrap();
        s.register(spec("b", 10, 5).with_heartbeat_timeout(Duration::seconds(100)), None).unwrap();
        assert_eq!(s.late_heartbeats(t0()), vec!["a".to_string(), "b".to_string()]);

        s.record_heartbeat("a", t0()).unwrap();
        s.record_heartbeat("b", t0()).unwrap();
        assert!(s.late_heartbeats(t0() + Duration::seconds(20)).is_empty());
        assert_eq!(s.late_heartbeats(t0() + Duration::seconds(21)), vec!["a".to_string()]);

        s.mark_start("b", t0()).unwrap();
        assert!(s.running_over_budget(t0() + Duration::seconds(5)).is_empty());
        assert_eq!(s.running_over_budget(t0() + Duration::seconds(6)), vec!["b".to_string()]);
    }

    #[test]
    fn invalid_specs() {
        assert!(StrategySpec::new("x", Duration::zero(), Duration::seconds(1)).is_err());
        assert!(StrategySpec::new("x", Duration::seconds(1), Duration::zero()).is_err());
        assert!(spec("x", 1, 1).with_jitter(Duration::seconds(-1)).is_err());
        let mut s = Scheduler::new(t0(), None);
        assert_eq!(s.mark_start("nope", t0()), Err(SchedulerError::Unknown("nope".into())));
    }
}
