//! Core Goal type and its lifecycle state machine.
//!
//! # Invariants
//! - `id` is immutable after creation
//! - `updated_at >= created_at`
//! - `status` only changes through the manager's transition API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a goal.
///
/// # Properties
/// - Globally unique within a deployment
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalId(Uuid);

impl GoalId {
    /// Create a new unique goal ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority of a customer goal, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unrecognized priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Status of a goal in its lifecycle.
///
/// # State Machine
/// ```text
/// Created -> Active -> Blocked -> Active       (resumed)
///                  \          \-> Escalated -> Active | Failed | Cancelled
///                  |\-> Completed
///                  |\-> Failed
///                   \-> Cancelled
/// ```
/// `Completed`, `Failed` and `Cancelled` are terminal. Cancellation is
/// allowed from every non-terminal state, `Created` and `Escalated` included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Accepted but not yet activated (transient; creation auto-activates).
    Created,
    /// Being worked by its owner agent.
    Active,
    /// Waiting on a retryable condition.
    Blocked,
    /// Handed to a human operator; pending external resolution.
    Escalated,
    /// Reached its objective.
    Completed,
    /// Could not be resolved.
    Failed,
    /// Withdrawn before resolution.
    Cancelled,
}

impl GoalStatus {
    /// Check if the goal is in a terminal state.
    ///
    /// `Escalated` is terminal-pending-human, not terminal: it can still be
    /// resumed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Cancelled
        )
    }

    /// Check whether the edge `self -> next` is in the allowed transition table.
    pub fn can_transition_to(&self, next: GoalStatus) -> bool {
        use GoalStatus::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Cancelled)
                | (Active, Blocked)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Blocked, Active)
                | (Blocked, Escalated)
                | (Blocked, Cancelled)
                | (Escalated, Active)
                | (Escalated, Failed)
                | (Escalated, Cancelled)
        )
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GoalStatus::Created => "created",
            GoalStatus::Active => "active",
            GoalStatus::Blocked => "blocked",
            GoalStatus::Escalated => "escalated",
            GoalStatus::Completed => "completed",
            GoalStatus::Failed => "failed",
            GoalStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A timestamped free-form progress note attached to a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressNote {
    pub at: DateTime<Utc>,
    pub note: String,
}

/// A tracked customer objective.
///
/// # Invariants
/// - `updated_at >= created_at`
/// - `status` transitions only via [`GoalStatus::can_transition_to`] edges
/// - If `parent_id.is_some()`, this is a sub-goal of a decomposed objective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    id: GoalId,
    description: String,
    owner_agent: String,
    priority: Priority,
    status: GoalStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    parent_id: Option<GoalId>,
    attempt_count: u32,
    last_error: Option<String>,
    notes: Vec<ProgressNote>,
}

impl Goal {
    /// Create a new goal in `Created` state.
    ///
    /// # Errors
    /// Returns `Err` if `description` or `owner_agent` is empty.
    pub(crate) fn new(
        description: String,
        owner_agent: String,
        priority: Priority,
        parent_id: Option<GoalId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        if description.trim().is_empty() {
            return Err("goal description cannot be empty".to_string());
        }
        if owner_agent.trim().is_empty() {
            return Err("goal owner agent cannot be empty".to_string());
        }
        let now = Utc::now();
        Ok(Self {
            id: GoalId::new(),
            description,
            owner_agent,
            priority,
            status: GoalStatus::Created,
            created_at: now,
            updated_at: now,
            deadline,
            parent_id,
            attempt_count: 0,
            last_error: None,
            notes: Vec::new(),
        })
    }

    // Getters - status and bookkeeping mutate only through the manager.

    pub fn id(&self) -> GoalId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn owner_agent(&self) -> &str {
        &self.owner_agent
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> GoalStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn parent_id(&self) -> Option<GoalId> {
        self.parent_id
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn notes(&self) -> &[ProgressNote] {
        &self.notes
    }

    /// Whether the deadline, if any, has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| d < now).unwrap_or(false)
    }

    // Internal mutation, reserved for the manager.

    pub(crate) fn set_status(&mut self, status: GoalStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now.max(self.created_at);
    }

    pub(crate) fn bump_attempts(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    pub(crate) fn set_last_error(&mut self, error: Option<String>) {
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub(crate) fn push_note(&mut self, note: String, now: DateTime<Utc>) {
        self.notes.push(ProgressNote { at: now, note });
        self.updated_at = now.max(self.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        use GoalStatus::*;
        let all = [
            Created, Active, Blocked, Escalated, Completed, Failed, Cancelled,
        ];
        for terminal in [Completed, Failed, Cancelled] {
            for next in all {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_cancellable_from_every_non_terminal_state() {
        use GoalStatus::*;
        for from in [Created, Active, Blocked, Escalated] {
            assert!(from.can_transition_to(Cancelled), "{from} must be cancellable");
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_priority_parse_rejects_unknown() {
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
    }

    #[test]
    fn test_empty_owner_rejected() {
        let goal = Goal::new("help".into(), "  ".into(), Priority::Normal, None, None);
        assert!(goal.is_err());
    }
}
