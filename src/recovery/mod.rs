//! Fault classification and recovery policy.
//!
//! The [`RecoveryHandler`] wraps every fallible operation in the deployment:
//! it classifies faults via the [`FaultKind`] taxonomy, retries or falls back
//! per policy, keeps a per-operation-class circuit breaker, and journals an
//! [`ExceptionRecord`] for every handled fault.

mod breaker;
mod fault;
mod handler;

pub use breaker::{Admission, BreakerState, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use fault::{classify_status, Fault, FaultKind};
pub use handler::{
    CallContext, ExceptionRecord, RecoveryError, RecoveryHandler, RecoveryOutcome,
    RecoveryStrategy, Sleeper, TokioSleeper,
};
