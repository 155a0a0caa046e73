//! Recovery handler: classify faults and apply recovery policy.
//!
//! Every component performing a fallible call (tool call, model call,
//! inter-agent request) wraps it in [`RecoveryHandler::execute`]. On failure
//! the handler consults the circuit breaker for the operation class, retries
//! with exponential backoff where the taxonomy allows it, falls back when a
//! fallback is supplied, and always hands back exactly one
//! [`ExceptionRecord`] describing what happened - callers never have to
//! inspect logs to learn that a retry occurred.
//!
//! Backoff sleeps go through the injectable [`Sleeper`] so tests simulate
//! delays without waiting, and never happen while a breaker lock is held.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::goal::GoalId;

use super::breaker::{Admission, CircuitRegistry, CircuitSnapshot};
use super::fault::{Fault, FaultKind};

/// Error surfaced to the caller of [`RecoveryHandler::execute`].
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The dependency is known-down; the wrapped function was not invoked.
    /// Distinct from an ordinary fault so callers can tell "the dependency
    /// is down" from "this one call failed".
    #[error("circuit open for operation class '{0}'")]
    CircuitOpen(String),

    /// The owning goal was cancelled; further retries were abandoned.
    #[error("operation cancelled")]
    Cancelled,

    /// Terminal fault after recovery policy was exhausted or ruled out retry.
    #[error(transparent)]
    Fault(#[from] Fault),
}

/// Recovery strategy the handler applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retried with exponential backoff.
    Retry,
    /// Retries exhausted; the registered fallback ran.
    Fallback,
    /// No recovery attempted (permanent or unclassified fault).
    FailFast,
}

/// Terminal outcome of one handled fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// A retry or the fallback produced a usable result.
    Recovered,
    /// Automated recovery exhausted; surfaced to the caller to block or
    /// escalate the owning goal.
    Escalated,
    /// Not recoverable (permanent/unclassified fault, or fallback failed).
    Fatal,
    /// The owning goal was cancelled mid-recovery.
    Cancelled,
}

/// Append-only record of one handled fault.
///
/// Records are totally ordered by `seq` (monotonic), never mutated after
/// creation, and pruned only by retention policy.
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionRecord {
    pub seq: u64,
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: FaultKind,
    pub operation_class: String,
    pub goal_id: Option<GoalId>,
    /// Attempts made against the wrapped function.
    pub attempts: u32,
    pub strategy: RecoveryStrategy,
    pub outcome: RecoveryOutcome,
    pub message: String,
}

/// Context threaded through one recovered call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Goal this operation works toward, for the exception record.
    pub goal_id: Option<GoalId>,
    /// Checked before every retry attempt; cancellation aborts recovery.
    pub cancel: Option<CancellationToken>,
}

impl CallContext {
    pub fn for_goal(goal_id: GoalId) -> Self {
        Self {
            goal_id: Some(goal_id),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

/// Injectable sleep, so tests can simulate backoff without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Default sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Shared fault-recovery service.
///
/// Cheap to clone; all clones share the breaker registry and the exception
/// journal.
#[derive(Clone)]
pub struct RecoveryHandler {
    config: RecoveryConfig,
    breakers: CircuitRegistry,
    journal: Arc<Mutex<Vec<ExceptionRecord>>>,
    seq: Arc<AtomicU64>,
    sleeper: Arc<dyn Sleeper>,
}

impl RecoveryHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: RecoveryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        let breakers = CircuitRegistry::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            config,
            breakers,
            journal: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
            sleeper,
        }
    }

    /// Run `op` under recovery policy for `operation_class`.
    ///
    /// Returns the result together with at most one exception record:
    /// `None` when the first attempt succeeded, `Some` whenever a fault was
    /// handled - even when recovery ultimately succeeded.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_class: &str,
        ctx: CallContext,
        op: F,
    ) -> (Result<T, RecoveryError>, Option<ExceptionRecord>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        self.run(
            operation_class,
            ctx,
            op,
            None::<std::future::Ready<Result<T, Fault>>>,
        )
        .await
    }

    /// Like [`execute`](Self::execute), with a fallback consulted after
    /// retries are exhausted. The fallback future is awaited at most once.
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        operation_class: &str,
        ctx: CallContext,
        op: F,
        fallback: FB,
    ) -> (Result<T, RecoveryError>, Option<ExceptionRecord>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
        FB: Future<Output = Result<T, Fault>>,
    {
        self.run(operation_class, ctx, op, Some(fallback)).await
    }

    async fn run<T, F, Fut, FB>(
        &self,
        class: &str,
        ctx: CallContext,
        mut op: F,
        fallback: Option<FB>,
    ) -> (Result<T, RecoveryError>, Option<ExceptionRecord>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
        FB: Future<Output = Result<T, Fault>>,
    {
        let mut attempts: u32 = 0;
        let mut last_fault: Option<Fault> = None;

        // Loop exits with the fault that exhausted the retry budget; every
        // other termination returns directly from inside.
        let fault = loop {
            if ctx.is_cancelled() {
                return match last_fault {
                    Some(fault) => {
                        let record = self
                            .record(
                                class,
                                &ctx,
                                fault.kind,
                                attempts,
                                RecoveryStrategy::Retry,
                                RecoveryOutcome::Cancelled,
                                fault.message.clone(),
                            )
                            .await;
                        (Err(RecoveryError::Cancelled), Some(record))
                    }
                    // Cancelled before any fault was classified: nothing to record.
                    None => (Err(RecoveryError::Cancelled), None),
                };
            }

            match self.breakers.admit(class).await {
                Admission::Allowed | Admission::Trial => {}
                Admission::Rejected => {
                    return match last_fault {
                        Some(fault) => {
                            let record = self
                                .record(
                                    class,
                                    &ctx,
                                    fault.kind,
                                    attempts,
                                    RecoveryStrategy::Retry,
                                    RecoveryOutcome::Escalated,
                                    format!("circuit opened during recovery: {}", fault.message),
                                )
                                .await;
                            (Err(RecoveryError::CircuitOpen(class.to_string())), Some(record))
                        }
                        // Fast fail: the wrapped function was never invoked,
                        // so no fault was classified and nothing is recorded.
                        None => (Err(RecoveryError::CircuitOpen(class.to_string())), None),
                    };
                }
            }

            attempts += 1;
            match op().await {
                Ok(value) => {
                    self.breakers.record_success(class).await;
                    return match last_fault {
                        Some(fault) => {
                            let record = self
                                .record(
                                    class,
                                    &ctx,
                                    fault.kind,
                                    attempts,
                                    RecoveryStrategy::Retry,
                                    RecoveryOutcome::Recovered,
                                    fault.message.clone(),
                                )
                                .await;
                            (Ok(value), Some(record))
                        }
                        None => (Ok(value), None),
                    };
                }
                Err(fault) => {
                    self.breakers.record_failure(class).await;
                    debug!(
                        class = class,
                        kind = %fault.kind,
                        attempt = attempts,
                        "Operation failed: {}",
                        fault.message
                    );

                    if !fault.is_retryable() {
                        if fault.kind == FaultKind::Unknown {
                            warn!(
                                class = class,
                                "Unclassified fault treated as permanent: {}", fault.message
                            );
                        }
                        let record = self
                            .record(
                                class,
                                &ctx,
                                fault.kind,
                                attempts,
                                RecoveryStrategy::FailFast,
                                RecoveryOutcome::Fatal,
                                fault.message.clone(),
                            )
                            .await;
                        return (Err(RecoveryError::Fault(fault)), Some(record));
                    }

                    if attempts >= self.config.max_attempts {
                        break fault;
                    }

                    let delay = self.backoff_delay(&fault, attempts);
                    last_fault = Some(fault);
                    // Sleep happens with no breaker lock held.
                    self.sleeper.sleep(delay).await;
                }
            }
        };

        if let Some(fallback) = fallback {
            debug!(class = class, "Retries exhausted, running fallback");
            return match fallback.await {
                Ok(value) => {
                    let record = self
                        .record(
                            class,
                            &ctx,
                            fault.kind,
                            attempts,
                            RecoveryStrategy::Fallback,
                            RecoveryOutcome::Recovered,
                            fault.message.clone(),
                        )
                        .await;
                    (Ok(value), Some(record))
                }
                Err(fallback_fault) => {
                    let record = self
                        .record(
                            class,
                            &ctx,
                            fault.kind,
                            attempts,
                            RecoveryStrategy::Fallback,
                            RecoveryOutcome::Fatal,
                            format!(
                                "fallback failed ({}) after: {}",
                                fallback_fault.message, fault.message
                            ),
                        )
                        .await;
                    (Err(RecoveryError::Fault(fallback_fault)), Some(record))
                }
            };
        }

        let record = self
            .record(
                class,
                &ctx,
                fault.kind,
                attempts,
                RecoveryStrategy::Retry,
                RecoveryOutcome::Escalated,
                fault.message.clone(),
            )
            .await;
        (Err(RecoveryError::Fault(fault)), Some(record))
    }

    /// Backoff before the next attempt: a retry-after hint wins; otherwise
    /// exponential from the configured base, with a higher floor for
    /// resource exhaustion, capped at the configured maximum.
    fn backoff_delay(&self, fault: &Fault, attempt: u32) -> Duration {
        if let Some(hint) = fault.retry_after {
            return hint.min(self.config.max_delay);
        }
        let base = match fault.kind {
            FaultKind::ResourceExhausted => self.config.base_delay.max(self.config.resource_floor),
            _ => self.config.base_delay,
        };
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(multiplier).min(self.config.max_delay)
    }

    /// Full exception history, in sequence order.
    pub async fn records(&self) -> Vec<ExceptionRecord> {
        self.journal.lock().await.clone()
    }

    /// Exception history for one operation class.
    pub async fn records_for_class(&self, class: &str) -> Vec<ExceptionRecord> {
        self.journal
            .lock()
            .await
            .iter()
            .filter(|r| r.operation_class == class)
            .cloned()
            .collect()
    }

    /// Drop records older than `cutoff`. The only way records ever leave the
    /// journal.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut journal = self.journal.lock().await;
        let before = journal.len();
        journal.retain(|r| r.occurred_at >= cutoff);
        before - journal.len()
    }

    /// Breaker snapshot for one operation class, if it has been exercised.
    pub async fn circuit(&self, class: &str) -> Option<CircuitSnapshot> {
        self.breakers.snapshot(class).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        class: &str,
        ctx: &CallContext,
        kind: FaultKind,
        attempts: u32,
        strategy: RecoveryStrategy,
        outcome: RecoveryOutcome,
        message: String,
    ) -> ExceptionRecord {
        let record = ExceptionRecord {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
            operation_class: class.to_string(),
            goal_id: ctx.goal_id,
            attempts,
            strategy,
            outcome,
            message,
        };
        self.journal.lock().await.push(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Records requested delays instead of sleeping.
    struct RecordingSleeper {
        delays: std::sync::Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delays: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn handler(config: RecoveryConfig) -> (RecoveryHandler, Arc<RecordingSleeper>) {
        let sleeper = RecordingSleeper::new();
        (
            RecoveryHandler::with_sleeper(config, sleeper.clone()),
            sleeper,
        )
    }

    #[tokio::test]
    async fn test_first_try_success_has_no_record() {
        let (handler, _) = handler(RecoveryConfig::default());
        let (result, record) = handler
            .execute("tool:faq", CallContext::default(), || async { Ok(42u32) })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert!(record.is_none());
        assert!(handler.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_recovers_with_single_record() {
        let (handler, _) = handler(RecoveryConfig {
            max_attempts: 3,
            ..RecoveryConfig::default()
        });
        let calls = AtomicU32::new(0);
        let (result, record) = handler
            .execute("tool:faq", CallContext::default(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Fault::transient("connection reset"))
                    } else {
                        Ok("answer")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "answer");
        let record = record.expect("handled fault must be recorded");
        assert_eq!(record.outcome, RecoveryOutcome::Recovered);
        assert_eq!(record.strategy, RecoveryStrategy::Retry);
        assert_eq!(record.attempts, 3);
        assert_eq!(handler.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_fails_fast() {
        let (handler, sleeper) = handler(RecoveryConfig::default());
        let calls = AtomicU32::new(0);
        let (result, record) = handler
            .execute("tool:billing", CallContext::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Fault::permanent("bad account id")) }
            })
            .await;

        assert!(matches!(result, Err(RecoveryError::Fault(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
        let record = record.unwrap();
        assert_eq!(record.outcome, RecoveryOutcome::Fatal);
        assert_eq!(record.strategy, RecoveryStrategy::FailFast);
    }

    #[tokio::test]
    async fn test_unknown_is_never_retried() {
        let (handler, _) = handler(RecoveryConfig::default());
        let calls = AtomicU32::new(0);
        let (result, record) = handler
            .execute("tool:misc", CallContext::default(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Fault::unknown("segfault in plugin")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The record keeps the unknown kind for operator visibility.
        assert_eq!(record.unwrap().kind, FaultKind::Unknown);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let (handler, sleeper) = handler(RecoveryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            ..RecoveryConfig::default()
        });
        let (result, record) = handler
            .execute("tool:faq", CallContext::default(), || async {
                Err::<(), _>(Fault::transient("timeout"))
            })
            .await;

        assert!(matches!(result, Err(RecoveryError::Fault(_))));
        let record = record.unwrap();
        assert_eq!(record.outcome, RecoveryOutcome::Escalated);
        assert_eq!(record.attempts, 3);
        // Exponential backoff: 100ms then 200ms between the three attempts.
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_retry_after_hint_wins() {
        let (handler, sleeper) = handler(RecoveryConfig {
            max_attempts: 2,
            ..RecoveryConfig::default()
        });
        let hint = Duration::from_secs(7);
        let (_, record) = handler
            .execute("model:chat", CallContext::default(), || async move {
                Err::<(), _>(Fault::resource_exhausted("quota", Some(hint)))
            })
            .await;

        assert_eq!(sleeper.delays(), vec![hint]);
        assert_eq!(record.unwrap().kind, FaultKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_resource_exhausted_uses_floor_without_hint() {
        let (handler, sleeper) = handler(RecoveryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            resource_floor: Duration::from_secs(5),
            ..RecoveryConfig::default()
        });
        handler
            .execute("model:chat", CallContext::default(), || async {
                Err::<(), _>(Fault::resource_exhausted("quota", None))
            })
            .await
            .0
            .ok();

        assert_eq!(sleeper.delays(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_fallback_recovers() {
        let (handler, _) = handler(RecoveryConfig {
            max_attempts: 2,
            ..RecoveryConfig::default()
        });
        let (result, record) = handler
            .execute_with_fallback(
                "tool:kb",
                CallContext::default(),
                || async { Err::<&str, _>(Fault::transient("kb down")) },
                async { Ok("canned answer") },
            )
            .await;

        assert_eq!(result.unwrap(), "canned answer");
        let record = record.unwrap();
        assert_eq!(record.strategy, RecoveryStrategy::Fallback);
        assert_eq!(record.outcome, RecoveryOutcome::Recovered);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_fatal() {
        let (handler, _) = handler(RecoveryConfig {
            max_attempts: 1,
            ..RecoveryConfig::default()
        });
        let (result, record) = handler
            .execute_with_fallback(
                "tool:kb",
                CallContext::default(),
                || async { Err::<(), _>(Fault::transient("kb down")) },
                async { Err(Fault::permanent("no cache either")) },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(record.unwrap().outcome, RecoveryOutcome::Fatal);
    }

    #[tokio::test]
    async fn test_circuit_fast_fail_skips_function() {
        let config = RecoveryConfig {
            max_attempts: 1,
            breaker_threshold: 3,
            breaker_cooldown: Duration::from_secs(600),
            ..RecoveryConfig::default()
        };
        let (handler, _) = handler(config);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let (result, _) = handler
                .execute("tool:crm", CallContext::default(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Fault::transient("down")) }
                })
                .await;
            assert!(matches!(result, Err(RecoveryError::Fault(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fourth call: circuit open, wrapped function never invoked.
        let calls4 = calls.clone();
        let (result, record) = handler
            .execute("tool:crm", CallContext::default(), move || {
                calls4.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(RecoveryError::CircuitOpen(_))));
        assert!(record.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_on_success() {
        let config = RecoveryConfig {
            max_attempts: 1,
            breaker_threshold: 1,
            breaker_cooldown: Duration::ZERO,
            ..RecoveryConfig::default()
        };
        let (handler, _) = handler(config);

        handler
            .execute("tool:crm", CallContext::default(), || async {
                Err::<(), _>(Fault::transient("down"))
            })
            .await
            .0
            .ok();
        let snap = handler.circuit("tool:crm").await.unwrap();
        assert_eq!(snap.consecutive_failures, 1);

        // Cool-down of zero: next call is the half-open trial and succeeds.
        let (result, _) = handler
            .execute("tool:crm", CallContext::default(), || async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        let snap = handler.circuit("tool:crm").await.unwrap();
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_retries() {
        let (handler, _) = handler(RecoveryConfig {
            max_attempts: 5,
            ..RecoveryConfig::default()
        });
        let cancel = CancellationToken::new();
        let ctx = CallContext::default().with_cancel(cancel.clone());
        let calls = AtomicU32::new(0);

        let (result, record) = handler
            .execute("tool:crm", ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                // Simulates the goal being cancelled while the call is failing.
                cancel.cancel();
                async { Err::<(), _>(Fault::transient("down")) }
            })
            .await;

        assert!(matches!(result, Err(RecoveryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.unwrap().outcome, RecoveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_records_are_sequenced_and_prunable() {
        let (handler, _) = handler(RecoveryConfig {
            max_attempts: 1,
            ..RecoveryConfig::default()
        });
        for _ in 0..3 {
            handler
                .execute("tool:crm", CallContext::default(), || async {
                    Err::<(), _>(Fault::transient("down"))
                })
                .await
                .0
                .ok();
        }
        let records = handler.records().await;
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));

        let pruned = handler
            .prune_before(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(pruned, 3);
        assert!(handler.records().await.is_empty());
    }
}
