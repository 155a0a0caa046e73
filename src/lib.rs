//! # swarmdesk
//!
//! Coordination substrate for a small society of cooperating
//! customer-service agents. Three shared, thread-safe services carry the
//! deployment:
//!
//! - [`goal::GoalManager`] - lifecycle of customer objectives: state
//!   machine, audit trail, aggregate reporting, escalation policy.
//! - [`recovery::RecoveryHandler`] - fault classification and recovery:
//!   retry with backoff, fallback, per-operation-class circuit breakers,
//!   append-only exception journal.
//! - [`hub::CommunicationHub`] - point-to-point and topic messaging
//!   between named agents, with per-agent bounded history.
//!
//! ## Data Flow
//! 1. A customer request becomes a goal (`created -> active`)
//! 2. The owning agent consults retrieval or delegates over the hub,
//!    wrapping every fallible call in the recovery handler
//! 3. Status transitions flow back to the goal manager until the goal is
//!    terminal - or escalated to a human when automation runs out
//!
//! The reference deployment is single-process multi-task: each agent is a
//! tokio task holding clones of the three service handles. There are no
//! process-wide singletons.

pub mod agents;
pub mod config;
pub mod goal;
pub mod hub;
pub mod knowledge;
pub mod recovery;

pub use config::Config;
pub use goal::{Goal, GoalManager, GoalStatus, Priority};
pub use hub::{CommunicationHub, Message};
pub use recovery::{Fault, RecoveryHandler};
