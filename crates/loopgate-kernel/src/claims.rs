//! Exclusive, lease-based task ownership.
//!
//! A claim runs as a fixed sequence of store writes. The store serializes
//! competing lock writes per task; a conflicting write is reported as a lost
//! race and becomes an ordinary rejection. Later-step failures undo the
//! earlier writes once, synchronously, without retry.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tasks::{LockRow, TaskEventRow, TaskRow, TaskStatus};

pub const DEFAULT_LEASE_MINUTES: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockWrite {
    Written,
    /// Another actor holds an active lock or won a concurrent insert.
    LostRace,
}

/// Storage operations a claim is built from.
pub trait ClaimStore {
    fn load_task(&self, task_id: &str) -> Result<Option<TaskRow>>;
    /// Every lock row for the task, active or not.
    fn lock_rows(&self, task_id: &str) -> Result<Vec<LockRow>>;
    /// Update the existing row when `row_exists`, else insert. Must only
    /// overwrite a row that is released, expired or already held by `actor`.
    fn write_lock(
        &self,
        task_id: &str,
        actor: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        row_exists: bool,
    ) -> Result<LockWrite>;
    /// Returns true when the owner row was created by this call.
    fn upsert_owner(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<bool>;
    fn mark_claimed(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Atomically release `actor`'s active lock, drop its owner row and
    /// reopen the task. Returns false, writing nothing, when `actor` no
    /// longer holds an active lock.
    fn release_claim(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<bool>;
    fn append_task_event(&self, event: &TaskEventRow) -> Result<()>;
    /// Idempotent: touches only `actor`'s unreleased row.
    fn release_lock(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<()>;
    fn delete_owner(&self, task_id: &str, actor: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub task_id: String,
    pub actor: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TaskNotOpen,
    LockHeld,
    LostRace,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimOutcome {
    #[serde(rename_all = "camelCase")]
    Claimed {
        task_id: String,
        locked_by: String,
        locked_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        refreshed: bool,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        task_id: String,
        reason: RejectReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_status: Option<TaskStatus>,
    },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed { .. } => "claimed",
            ClaimOutcome::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    #[serde(rename_all = "camelCase")]
    Released {
        task_id: String,
        released_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    NotHeld {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimStep {
    LoadTask,
    ReadLocks,
    WriteLock,
    Assign,
    MarkClaimed,
    AppendEvent,
    Release,
}

impl ClaimStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStep::LoadTask => "load_task",
            ClaimStep::ReadLocks => "read_locks",
            ClaimStep::WriteLock => "write_lock",
            ClaimStep::Assign => "assign",
            ClaimStep::MarkClaimed => "mark_claimed",
            ClaimStep::AppendEvent => "append_event",
            ClaimStep::Release => "release",
        }
    }
}

impl fmt::Display for ClaimStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infrastructure failures. Expected negative outcomes are [`ClaimOutcome::Rejected`].
#[derive(thiserror::Error, Debug)]
pub enum ClaimError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("claim step {step} failed: {message}")]
    Step { step: ClaimStep, message: String },
    #[error("claim step {step} failed: {message}; compensation failed: {compensation}")]
    CompensationFailed {
        step: ClaimStep,
        message: String,
        compensation: String,
    },
    #[error("claim worker failed: {0}")]
    Worker(String),
}

fn step_err(step: ClaimStep) -> impl Fn(anyhow::Error) -> ClaimError {
    move |e| ClaimError::Step {
        step,
        message: format!("{e:#}"),
    }
}

#[cfg(feature = "metrics")]
fn count_claim(status: &'static str) {
    metrics::counter!("loopgate_claims_total", "status" => status).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn count_claim(_status: &'static str) {}

#[cfg(feature = "metrics")]
fn count_compensation(step: ClaimStep) {
    metrics::counter!("loopgate_claim_compensations_total", "step" => step.as_str()).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn count_compensation(_step: ClaimStep) {}

#[derive(Clone)]
pub struct ClaimCoordinator<S> {
    store: S,
    lease: Duration,
}

impl<S: ClaimStore> ClaimCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_lease(store, Duration::minutes(DEFAULT_LEASE_MINUTES))
    }

    pub fn with_lease(store: S, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, ClaimError> {
        let now = req.now;
        let task_id = req.task_id.as_str();

        let task = self
            .store
            .load_task(task_id)
            .map_err(step_err(ClaimStep::LoadTask))?
            .ok_or_else(|| ClaimError::NotFound(task_id.to_string()))?;
        if !task.status.is_claimable() {
            count_claim("rejected");
            return Ok(ClaimOutcome::Rejected {
                task_id: task_id.to_string(),
                reason: RejectReason::TaskNotOpen,
                locked_by: None,
                expires_at: None,
                task_status: Some(task.status),
            });
        }

        let rows = self
            .store
            .lock_rows(task_id)
            .map_err(step_err(ClaimStep::ReadLocks))?;
        let active = rows.iter().find(|r| r.is_active(now));
        if let Some(lock) = active {
            if lock.locked_by != req.actor {
                count_claim("rejected");
                return Ok(ClaimOutcome::Rejected {
                    task_id: task_id.to_string(),
                    reason: RejectReason::LockHeld,
                    locked_by: Some(lock.locked_by.clone()),
                    expires_at: Some(lock.expires_at),
                    task_status: None,
                });
            }
        }
        let refreshed = active.is_some();

        let expires_at = now + self.lease;
        let write = self
            .store
            .write_lock(task_id, &req.actor, now, expires_at, !rows.is_empty())
            .map_err(step_err(ClaimStep::WriteLock))?;
        if write == LockWrite::LostRace {
            tracing::debug!(task_id, actor = %req.actor, "claim lost the lock race");
            let holder = self
                .store
                .lock_rows(task_id)
                .ok()
                .and_then(|rows| rows.into_iter().find(|r| r.is_active(now)));
            count_claim("rejected");
            return Ok(ClaimOutcome::Rejected {
                task_id: task_id.to_string(),
                reason: RejectReason::LostRace,
                locked_by: holder.as_ref().map(|h| h.locked_by.clone()),
                expires_at: holder.map(|h| h.expires_at),
                task_status: None,
            });
        }

        let created = match self.store.upsert_owner(task_id, &req.actor, now) {
            Ok(created) => created,
            Err(e) => return Err(self.compensate(ClaimStep::Assign, e, req, false)),
        };

        let marked = self
            .store
            .mark_claimed(task_id, now)
            .and_then(|ok| {
                if ok {
                    Ok(())
                } else {
                    Err(anyhow!("task {task_id} left the claimable states"))
                }
            });
        if let Err(e) = marked {
            return Err(self.compensate(ClaimStep::MarkClaimed, e, req, created));
        }

        let event = TaskEventRow {
            task_id: task_id.to_string(),
            kind: "claimed".into(),
            actor: Some(req.actor.clone()),
            from_status: Some(task.status.as_str().into()),
            to_status: Some(TaskStatus::Claimed.as_str().into()),
            meta: serde_json::json!({
                "userAgent": req.user_agent,
                "ipAddress": req.ip_address,
                "expiresAt": crate::ts(expires_at),
                "refreshed": refreshed,
            }),
            time: now,
        };
        if let Err(e) = self.store.append_task_event(&event) {
            tracing::warn!(task_id, error = %format!("{e:#}"), "claim event append failed");
        }

        count_claim("claimed");
        tracing::info!(task_id, actor = %req.actor, refreshed, "task claimed");
        Ok(ClaimOutcome::Claimed {
            task_id: task_id.to_string(),
            locked_by: req.actor.clone(),
            locked_at: now,
            expires_at,
            refreshed,
        })
    }

    /// Undo the lock write, and the owner row when `drop_owner`, after
    /// `step` failed.
    fn compensate(
        &self,
        step: ClaimStep,
        err: anyhow::Error,
        req: &ClaimRequest,
        drop_owner: bool,
    ) -> ClaimError {
        count_compensation(step);
        let message = format!("{err:#}");
        tracing::warn!(task_id = %req.task_id, %step, error = %message, "claim failed; compensating");

        let mut failures = Vec::new();
        if let Err(e) = self.store.release_lock(&req.task_id, &req.actor, req.now) {
            failures.push(format!("release lock: {e:#}"));
        }
        if drop_owner {
            if let Err(e) = self.store.delete_owner(&req.task_id, &req.actor) {
                failures.push(format!("delete assignment: {e:#}"));
            }
        }

        if failures.is_empty() {
            ClaimError::Step { step, message }
        } else {
            let compensation = failures.join("; ");
            tracing::error!(
                task_id = %req.task_id,
                %step,
                %compensation,
                "claim compensation failed; store left inconsistent until reconcile"
            );
            ClaimError::CompensationFailed {
                step,
                message,
                compensation,
            }
        }
    }

    /// Give up a lease held by `actor` and reopen the task.
    pub fn release(
        &self,
        task_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, ClaimError> {
        let step = step_err(ClaimStep::Release);
        let task = self
            .store
            .load_task(task_id)
            .map_err(step_err(ClaimStep::LoadTask))?
            .ok_or_else(|| ClaimError::NotFound(task_id.to_string()))?;
        let active = self
            .store
            .lock_rows(task_id)
            .map_err(step_err(ClaimStep::ReadLocks))?
            .into_iter()
            .find(|r| r.is_active(now));
        match active {
            Some(lock) if lock.locked_by == actor => {}
            other => {
                return Ok(ReleaseOutcome::NotHeld {
                    task_id: task_id.to_string(),
                    locked_by: other.map(|l| l.locked_by),
                })
            }
        }

        if !self.store.release_claim(task_id, actor, now).map_err(&step)? {
            // Lease lapsed or was taken over since the read above.
            let holder = self
                .store
                .lock_rows(task_id)
                .map_err(step_err(ClaimStep::ReadLocks))?
                .into_iter()
                .find(|r| r.is_active(now))
                .map(|l| l.locked_by);
            return Ok(ReleaseOutcome::NotHeld {
                task_id: task_id.to_string(),
                locked_by: holder,
            });
        }

        let event = TaskEventRow {
            task_id: task_id.to_string(),
            kind: "released".into(),
            actor: Some(actor.to_string()),
            from_status: Some(task.status.as_str().into()),
            to_status: Some(TaskStatus::Open.as_str().into()),
            meta: serde_json::json!({}),
            time: now,
        };
        if let Err(e) = self.store.append_task_event(&event) {
            tracing::warn!(task_id, error = %format!("{e:#}"), "release event append failed");
        }
        tracing::info!(task_id, actor, "task released");
        Ok(ReleaseOutcome::Released {
            task_id: task_id.to_string(),
            released_at: now,
        })
    }
}

impl<S> ClaimCoordinator<S>
where
    S: ClaimStore + Clone + Send + Sync + 'static,
{
    pub async fn claim_async(&self, req: ClaimRequest) -> Result<ClaimOutcome, ClaimError> {
        let c = self.clone();
        tokio::task::spawn_blocking(move || c.claim(&req))
            .await
            .map_err(|e| ClaimError::Worker(e.to_string()))?
    }

    pub async fn release_async(
        &self,
        task_id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, ClaimError> {
        let c = self.clone();
        let (task_id, actor) = (task_id.to_string(), actor.to_string());
        tokio::task::spawn_blocking(move || c.release(&task_id, &actor, now))
            .await
            .map_err(|e| ClaimError::Worker(e.to_string()))?
    }
}
