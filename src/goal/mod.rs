//! Goal lifecycle tracking.
//!
//! A [`Goal`] is a customer objective with a defined state machine; the
//! [`GoalManager`] is the single writer for goal state and the source of
//! aggregate reporting and escalation policy.

mod goal;
mod manager;

pub use goal::{Goal, GoalId, GoalStatus, Priority, ProgressNote};
pub use manager::{AuditEntry, GoalError, GoalEvent, GoalManager, GoalReport};
