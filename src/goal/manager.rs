//! Goal Manager: single source of truth for goal lifecycle and reporting.
//!
//! Agents never write goal fields directly; every status change goes through
//! [`GoalManager::transition`], which validates the edge against the state
//! machine, stamps `updated_at`, appends to the audit trail and broadcasts a
//! [`GoalEvent`]. Escalation is a manager-owned safety valve: once a goal has
//! been blocked more times than the configured retry ceiling, the next
//! blocked transition lands in `Escalated` instead.
//!
//! Transitions on the same goal serialize on that goal's own lock;
//! transitions on different goals proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GoalConfig;

use super::goal::{Goal, GoalId, GoalStatus, Priority};

/// Errors surfaced by the Goal Manager. Always synchronous, never retried.
#[derive(Debug, Clone, Error)]
pub enum GoalError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Goal not found: {0}")]
    NotFound(GoalId),

    #[error("Invalid goal transition from {from} to {to}")]
    InvalidTransition { from: GoalStatus, to: GoalStatus },

    #[error("Goal {0} is closed")]
    GoalClosed(GoalId),
}

/// One entry of the append-only transition audit trail.
///
/// Entries are totally ordered by `seq`, a monotonic counter, so audit order
/// stays deterministic under clock skew.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub goal_id: GoalId,
    pub from: GoalStatus,
    pub to: GoalStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Broadcast on every goal transition. The human escalation sink subscribes
/// to this stream and reacts to `to == Escalated`.
#[derive(Debug, Clone)]
pub enum GoalEvent {
    Transitioned {
        goal_id: GoalId,
        from: GoalStatus,
        to: GoalStatus,
        reason: Option<String>,
    },
}

/// Aggregate status report across all tracked goals.
#[derive(Debug, Clone, Serialize)]
pub struct GoalReport {
    pub total: usize,
    pub by_status: HashMap<GoalStatus, usize>,
    /// `completed / (total - cancelled)`; defined as `0.0` when the
    /// denominator is zero.
    pub completion_rate: f64,
}

struct GoalCell {
    goal: Goal,
    cancel: CancellationToken,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Thread-safe goal lifecycle service, shared across all agent tasks.
#[derive(Clone)]
pub struct GoalManager {
    goals: Arc<RwLock<HashMap<GoalId, Arc<Mutex<GoalCell>>>>>,
    /// Parent to direct children, so completing a parent only ever inspects
    /// its own children instead of scanning every goal.
    children: Arc<RwLock<HashMap<GoalId, Vec<GoalId>>>>,
    audit: Arc<Mutex<Vec<AuditEntry>>>,
    audit_seq: Arc<AtomicU64>,
    events: broadcast::Sender<GoalEvent>,
    config: GoalConfig,
}

impl GoalManager {
    pub fn new(config: GoalConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            goals: Arc::new(RwLock::new(HashMap::new())),
            children: Arc::new(RwLock::new(HashMap::new())),
            audit: Arc::new(Mutex::new(Vec::new())),
            audit_seq: Arc::new(AtomicU64::new(0)),
            events,
            config,
        }
    }

    /// Subscribe to the transition event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GoalEvent> {
        self.events.subscribe()
    }

    /// Accept a new customer objective.
    ///
    /// The goal is inserted in `Created` state and immediately auto-transitions
    /// to `Active`; both steps appear in the audit trail.
    ///
    /// # Errors
    /// - `InvalidInput` if `description` or `owner` is empty
    /// - `NotFound` if `parent_id` refers to an unknown goal
    pub async fn create_goal(
        &self,
        description: impl Into<String>,
        owner: impl Into<String>,
        priority: Priority,
        parent_id: Option<GoalId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Goal, GoalError> {
        let goal = Goal::new(
            description.into(),
            owner.into(),
            priority,
            parent_id,
            deadline,
        )
        .map_err(GoalError::InvalidInput)?;

        if let Some(parent) = parent_id {
            let goals = self.goals.read().await;
            if !goals.contains_key(&parent) {
                return Err(GoalError::NotFound(parent));
            }
        }

        let id = goal.id();
        let cell = Arc::new(Mutex::new(GoalCell {
            goal,
            cancel: CancellationToken::new(),
        }));
        self.goals.write().await.insert(id, cell.clone());
        if let Some(parent) = parent_id {
            self.children.write().await.entry(parent).or_default().push(id);
        }

        // No separate scheduling step: creation activates the goal right away.
        let mut cell = cell.lock().await;
        cell.goal.set_status(GoalStatus::Active, Utc::now());
        self.record(
            id,
            GoalStatus::Created,
            GoalStatus::Active,
            Some("accepted".to_string()),
        )
        .await;

        info!(goal_id = %id, owner = cell.goal.owner_agent(), priority = %priority, "Goal created");
        Ok(cell.goal.clone())
    }

    /// Move a goal along one edge of the state machine.
    ///
    /// A transition to `Blocked` increments `attempt_count`; once the count
    /// exceeds the configured retry ceiling the goal lands in `Escalated`
    /// instead (recorded as a second audit entry `Blocked -> Escalated`, so
    /// the observed status sequence stays a valid walk).
    ///
    /// A parent goal cannot reach `Completed` while any of its children is
    /// neither `Completed` nor `Cancelled`.
    ///
    /// # Errors
    /// - `NotFound` if the id is unknown
    /// - `InvalidTransition` if the edge is not in the allowed table
    pub async fn transition(
        &self,
        goal_id: GoalId,
        new_status: GoalStatus,
        reason: Option<String>,
    ) -> Result<Goal, GoalError> {
        let cell = self.cell(goal_id).await?;
        let mut cell = cell.lock().await;

        let from = cell.goal.status();
        if !from.can_transition_to(new_status) {
            return Err(GoalError::InvalidTransition {
                from,
                to: new_status,
            });
        }

        if new_status == GoalStatus::Completed {
            self.ensure_children_closed(goal_id).await?;
        }

        let now = Utc::now();
        cell.goal.set_status(new_status, now);
        if matches!(
            new_status,
            GoalStatus::Blocked | GoalStatus::Failed | GoalStatus::Escalated
        ) {
            cell.goal.set_last_error(reason.clone());
        }
        self.record(goal_id, from, new_status, reason).await;
        debug!(goal_id = %goal_id, from = %from, to = %new_status, "Goal transitioned");

        if new_status == GoalStatus::Blocked {
            cell.goal.bump_attempts();
            if cell.goal.attempt_count() > self.config.retry_ceiling {
                // Manager-owned safety valve: the caller asked for Blocked,
                // policy says this goal is out of automated retries.
                let reason = format!(
                    "retry ceiling of {} exceeded after {} attempts",
                    self.config.retry_ceiling,
                    cell.goal.attempt_count()
                );
                cell.goal.set_status(GoalStatus::Escalated, Utc::now());
                cell.goal.set_last_error(Some(reason.clone()));
                self.record(
                    goal_id,
                    GoalStatus::Blocked,
                    GoalStatus::Escalated,
                    Some(reason),
                )
                .await;
                warn!(
                    goal_id = %goal_id,
                    attempts = cell.goal.attempt_count(),
                    "Goal escalated to human operator"
                );
            }
        }

        if cell.goal.status() == GoalStatus::Cancelled {
            cell.cancel.cancel();
        }

        Ok(cell.goal.clone())
    }

    /// Attach a progress note without changing status.
    ///
    /// # Errors
    /// `GoalClosed` if the goal is terminal. Notes on `Escalated` goals are
    /// allowed; a human may still be working them.
    pub async fn report_progress(
        &self,
        goal_id: GoalId,
        note: impl Into<String>,
    ) -> Result<(), GoalError> {
        let cell = self.cell(goal_id).await?;
        let mut cell = cell.lock().await;
        if cell.goal.status().is_terminal() {
            return Err(GoalError::GoalClosed(goal_id));
        }
        cell.goal.push_note(note.into(), Utc::now());
        Ok(())
    }

    /// Snapshot of a single goal.
    pub async fn get_goal(&self, goal_id: GoalId) -> Result<Goal, GoalError> {
        let cell = self.cell(goal_id).await?;
        let cell = cell.lock().await;
        Ok(cell.goal.clone())
    }

    /// Cancellation token for a goal; fired when the goal is cancelled.
    ///
    /// In-flight operations check it between retry attempts and abort
    /// cooperatively instead of failing the goal.
    pub async fn cancellation_token(&self, goal_id: GoalId) -> Result<CancellationToken, GoalError> {
        let cell = self.cell(goal_id).await?;
        let cell = cell.lock().await;
        Ok(cell.cancel.clone())
    }

    /// Aggregate status report across all tracked goals.
    pub async fn get_report(&self) -> GoalReport {
        let cells = self.snapshot_cells().await;
        let mut by_status: HashMap<GoalStatus, usize> = HashMap::new();
        let mut total = 0usize;
        for cell in cells {
            let cell = cell.lock().await;
            *by_status.entry(cell.goal.status()).or_insert(0) += 1;
            total += 1;
        }
        let completed = by_status.get(&GoalStatus::Completed).copied().unwrap_or(0);
        let cancelled = by_status.get(&GoalStatus::Cancelled).copied().unwrap_or(0);
        let denominator = total.saturating_sub(cancelled);
        let completion_rate = if denominator == 0 {
            0.0
        } else {
            completed as f64 / denominator as f64
        };
        GoalReport {
            total,
            by_status,
            completion_rate,
        }
    }

    /// Non-terminal goals whose deadline has passed.
    pub async fn list_overdue(&self, now: DateTime<Utc>) -> Vec<Goal> {
        let mut overdue = Vec::new();
        for cell in self.snapshot_cells().await {
            let cell = cell.lock().await;
            if !cell.goal.status().is_terminal() && cell.goal.is_overdue(now) {
                overdue.push(cell.goal.clone());
            }
        }
        overdue
    }

    /// All non-terminal goals, most urgent first, oldest first within a tier.
    pub async fn active_goals(&self) -> Vec<Goal> {
        let mut active = Vec::new();
        for cell in self.snapshot_cells().await {
            let cell = cell.lock().await;
            if !cell.goal.status().is_terminal() {
                active.push(cell.goal.clone());
            }
        }
        active.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then(a.created_at().cmp(&b.created_at()))
        });
        active
    }

    /// Rough completion fraction in `[0, 1]` for a goal.
    ///
    /// Completed goals report `1.0`; failed and cancelled goals `0.0`. For a
    /// goal in flight with a deadline, progress is the elapsed fraction of
    /// its time budget; without a deadline it reports `0.5`.
    pub async fn progress(&self, goal_id: GoalId) -> Result<f64, GoalError> {
        let cell = self.cell(goal_id).await?;
        let cell = cell.lock().await;
        let goal = &cell.goal;
        let fraction = match goal.status() {
            GoalStatus::Completed => 1.0,
            GoalStatus::Failed | GoalStatus::Cancelled => 0.0,
            _ => match goal.deadline() {
                Some(deadline) => {
                    let total = (deadline - goal.created_at()).num_milliseconds();
                    if total <= 0 {
                        0.0
                    } else {
                        let elapsed = (Utc::now() - goal.created_at()).num_milliseconds();
                        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
                    }
                }
                None => 0.5,
            },
        };
        Ok(fraction)
    }

    /// Evict terminal goals that have been closed longer than the retention
    /// window. Non-terminal goals are never dropped.
    ///
    /// Returns the evicted goals.
    pub async fn archive(&self, now: DateTime<Utc>) -> Vec<Goal> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        // Decide eligibility without holding the map write lock: terminal
        // goals never change again, so the decision cannot go stale.
        let mut evict = Vec::new();
        for (id, cell) in self.snapshot_entries().await {
            let cell = cell.lock().await;
            if cell.goal.status().is_terminal() && cell.goal.updated_at() + retention <= now {
                evict.push((id, cell.goal.clone()));
            }
        }

        let mut goals = self.goals.write().await;
        let mut evicted = Vec::with_capacity(evict.len());
        for (id, goal) in evict {
            if goals.remove(&id).is_some() {
                info!(goal_id = %id, status = %goal.status(), "Goal archived");
                evicted.push(goal);
            }
        }
        drop(goals);

        if !evicted.is_empty() {
            let mut children = self.children.write().await;
            for goal in &evicted {
                children.remove(&goal.id());
                if let Some(parent) = goal.parent_id() {
                    if let Some(siblings) = children.get_mut(&parent) {
                        siblings.retain(|c| *c != goal.id());
                    }
                }
            }
        }
        evicted
    }

    /// Audit trail entries for one goal, in sequence order.
    pub async fn audit_trail(&self, goal_id: GoalId) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .await
            .iter()
            .filter(|e| e.goal_id == goal_id)
            .cloned()
            .collect()
    }

    async fn cell(&self, goal_id: GoalId) -> Result<Arc<Mutex<GoalCell>>, GoalError> {
        self.goals
            .read()
            .await
            .get(&goal_id)
            .cloned()
            .ok_or(GoalError::NotFound(goal_id))
    }

    async fn snapshot_cells(&self) -> Vec<Arc<Mutex<GoalCell>>> {
        self.goals.read().await.values().cloned().collect()
    }

    async fn snapshot_entries(&self) -> Vec<(GoalId, Arc<Mutex<GoalCell>>)> {
        self.goals
            .read()
            .await
            .iter()
            .map(|(id, cell)| (*id, cell.clone()))
            .collect()
    }

    /// Only a goal's direct children are locked while its own cell is held.
    /// Parent edges form a forest (a parent must exist before its child), so
    /// parent-then-child acquisition order is acyclic and deadlock free.
    async fn ensure_children_closed(&self, parent: GoalId) -> Result<(), GoalError> {
        let child_ids = self
            .children
            .read()
            .await
            .get(&parent)
            .cloned()
            .unwrap_or_default();
        for id in child_ids {
            // Index entries are pruned on archive; a missing cell can only be
            // a goal evicted between the index read and here.
            let Ok(cell) = self.cell(id).await else { continue };
            let cell = cell.lock().await;
            if !matches!(
                cell.goal.status(),
                GoalStatus::Completed | GoalStatus::Cancelled
            ) {
                return Err(GoalError::InvalidTransition {
                    from: GoalStatus::Active,
                    to: GoalStatus::Completed,
                });
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        goal_id: GoalId,
        from: GoalStatus,
        to: GoalStatus,
        reason: Option<String>,
    ) {
        let entry = AuditEntry {
            seq: self.audit_seq.fetch_add(1, Ordering::SeqCst),
            goal_id,
            from,
            to,
            reason: reason.clone(),
            at: Utc::now(),
        };
        self.audit.lock().await.push(entry);
        let _ = self.events.send(GoalEvent::Transitioned {
            goal_id,
            from,
            to,
            reason,
        });
    }
}
