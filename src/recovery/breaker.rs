//! Per-operation-class circuit breakers.
//!
//! One [`CircuitState`] per operation class (e.g. `"call:knowledge_retrieval"`),
//! each behind its own lock so concurrent callers of different classes never
//! contend. While a circuit is open every call for that class fails fast; a
//! cool-down later, exactly one trial call is admitted (half-open).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Breaker state for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast until the cool-down elapses.
    Open,
    /// One trial call in flight; everyone else fails fast.
    HalfOpen,
}

/// Mutable breaker bookkeeping for one operation class.
#[derive(Debug)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub state: BreakerState,
    pub opened_at: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            state: BreakerState::Closed,
            opened_at: None,
        }
    }
}

/// Read-only view of a circuit, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub operation_class: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// Remaining cool-down in seconds while open.
    pub cooldown_remaining_secs: Option<f64>,
}

/// Outcome of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally.
    Allowed,
    /// Circuit just moved to half-open; this caller holds the single trial.
    Trial,
    /// Circuit open (or a trial is already in flight); fail fast.
    Rejected,
}

/// Registry of circuit breakers, keyed by operation class.
#[derive(Clone)]
pub struct CircuitRegistry {
    classes: Arc<RwLock<HashMap<String, Arc<Mutex<CircuitState>>>>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            classes: Arc::new(RwLock::new(HashMap::new())),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Ask whether a call for `class` may proceed.
    ///
    /// An open circuit whose cool-down has elapsed flips to half-open and
    /// admits the asking caller as the single trial.
    pub async fn admit(&self, class: &str) -> Admission {
        let cell = self.cell(class).await;
        let mut state = cell.lock().await;
        match state.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Rejected,
            BreakerState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    state.state = BreakerState::HalfOpen;
                    info!(class = class, "Circuit half-open, admitting trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call: close the circuit and reset the counter.
    pub async fn record_success(&self, class: &str) {
        let cell = self.cell(class).await;
        let mut state = cell.lock().await;
        if state.state != BreakerState::Closed {
            info!(class = class, "Circuit closed after successful call");
        }
        state.state = BreakerState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Record a failed call.
    ///
    /// A half-open trial failure reopens the circuit with a fresh `opened_at`;
    /// otherwise the failure counter grows and crossing the threshold opens
    /// the circuit.
    pub async fn record_failure(&self, class: &str) {
        let cell = self.cell(class).await;
        let mut state = cell.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.state {
            BreakerState::HalfOpen => {
                state.state = BreakerState::Open;
                state.opened_at = Some(Instant::now());
                warn!(class = class, "Trial call failed, circuit reopened");
            }
            BreakerState::Closed if state.consecutive_failures >= self.threshold => {
                state.state = BreakerState::Open;
                state.opened_at = Some(Instant::now());
                warn!(
                    class = class,
                    consecutive_failures = state.consecutive_failures,
                    "Failure threshold crossed, circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Snapshot of one class, if it has been seen.
    pub async fn snapshot(&self, class: &str) -> Option<CircuitSnapshot> {
        let classes = self.classes.read().await;
        let cell = classes.get(class)?.clone();
        drop(classes);
        let state = cell.lock().await;
        let cooldown_remaining_secs = match (state.state, state.opened_at) {
            (BreakerState::Open, Some(at)) => {
                Some((self.cooldown.saturating_sub(at.elapsed())).as_secs_f64())
            }
            _ => None,
        };
        Some(CircuitSnapshot {
            operation_class: class.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            cooldown_remaining_secs,
        })
    }

    async fn cell(&self, class: &str) -> Arc<Mutex<CircuitState>> {
        {
            let classes = self.classes.read().await;
            if let Some(cell) = classes.get(class) {
                return cell.clone();
            }
        }
        let mut classes = self.classes.write().await;
        classes
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new())))
            .clone()
    }
}
