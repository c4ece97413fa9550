use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::claims::{ClaimStore, LockWrite};
use crate::{parse_ts, ts, Kernel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Claimed,
    InProgress,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        }
    }

    /// Open tasks, and claimed ones so the holder can refresh and an expired
    /// lease can be taken over.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::Claimed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "claimed" => Ok(TaskStatus::Claimed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "closed" => Ok(TaskStatus::Closed),
            other => Err(anyhow!("unknown task status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub source: Option<String>,
    pub renewals: u32,
    pub renewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    /// Instant the current timebox started: the last renewal, else creation.
    pub fn timebox_anchor(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRow {
    pub task_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl LockRow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub task_id: String,
    pub user_id: String,
    pub role: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventRow {
    pub task_id: String,
    pub kind: String,
    pub actor: Option<String>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub meta: serde_json::Value,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRow {
    pub task_id: String,
    pub renewals: u32,
    pub requires_evaluation: bool,
    pub renewed_at: DateTime<Utc>,
}

fn col_ts(r: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = r.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn col_ts_opt(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match r.get::<_, Option<String>>(idx)? {
        Some(_) => col_ts(r, idx).map(Some),
        None => Ok(None),
    }
}

fn task_from_row(r: &Row<'_>) -> rusqlite::Result<TaskRow> {
    let status_s: String = r.get(2)?;
    let status = status_s.parse::<TaskStatus>().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
    })?;
    Ok(TaskRow {
        id: r.get(0)?,
        title: r.get(1)?,
        status,
        source: r.get(3)?,
        renewals: r.get(4)?,
        renewed_at: col_ts_opt(r, 5)?,
        created_at: col_ts(r, 6)?,
        updated_at: col_ts(r, 7)?,
    })
}

fn lock_from_row(r: &Row<'_>) -> rusqlite::Result<LockRow> {
    Ok(LockRow {
        task_id: r.get(0)?,
        locked_by: r.get(1)?,
        locked_at: col_ts(r, 2)?,
        expires_at: col_ts(r, 3)?,
        released_at: col_ts_opt(r, 4)?,
    })
}

const TASK_COLS: &str = "id,title,status,source,renewals,renewed_at,created_at,updated_at";

impl Kernel {
    /// Insert an `open` task. Returns false if the id already existed.
    pub fn create_task(
        &self,
        id: &str,
        title: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now_s = ts(now);
        let n = conn.execute(
            "INSERT OR IGNORE INTO tasks(id,title,status,source,renewals,created_at,updated_at) VALUES(?,?,'open',?,0,?,?)",
            params![id, title, source, now_s, now_s],
        )?;
        Ok(n == 1)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM tasks WHERE id=?"),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET status=?, updated_at=? WHERE id=?",
            params![status.as_str(), ts(now), id],
        )?;
        Ok(n == 1)
    }

    /// Count a renewal and log it, unless the task already reached
    /// `renewal_limit` (returns `None`, nothing written). `requires_evaluation`
    /// is decided on the count after this renewal.
    pub fn renew_task(
        &self,
        id: &str,
        actor: &str,
        now: DateTime<Utc>,
        renewal_limit: u32,
        evaluation_after: u32,
    ) -> Result<Option<RenewalRow>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_s = ts(now);
        let n = tx.execute(
            "UPDATE tasks SET renewals=renewals+1, renewed_at=?1, updated_at=?1 WHERE id=?2 AND renewals < ?3",
            params![now_s, id, renewal_limit],
        )?;
        if n == 0 {
            let exists = tx
                .query_row("SELECT 1 FROM tasks WHERE id=?", params![id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(anyhow!("task {id} not found"));
            }
            tracing::debug!(task_id = id, renewal_limit, "renewal refused at ceiling");
            return Ok(None);
        }
        let renewals: u32 =
            tx.query_row("SELECT renewals FROM tasks WHERE id=?", params![id], |r| r.get(0))?;
        let requires_evaluation = renewals >= evaluation_after;
        tx.execute(
            "INSERT INTO task_renewals(task_id,renewal_no,requires_evaluation,actor,time) VALUES(?,?,?,?,?)",
            params![id, renewals, requires_evaluation, actor, now_s],
        )?;
        tx.commit()?;
        Ok(Some(RenewalRow {
            task_id: id.to_string(),
            renewals,
            requires_evaluation,
            renewed_at: now,
        }))
    }

    pub fn task_lock(&self, task_id: &str) -> Result<Option<LockRow>> {
        Ok(self.lock_rows(task_id)?.into_iter().next())
    }

    pub fn assignments(&self, task_id: &str) -> Result<Vec<AssignmentRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id,user_id,role,assigned_at FROM task_assignments WHERE task_id=? ORDER BY assigned_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |r| {
            Ok(AssignmentRow {
                task_id: r.get(0)?,
                user_id: r.get(1)?,
                role: r.get(2)?,
                assigned_at: col_ts(r, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn task_events(&self, task_id: &str) -> Result<Vec<TaskEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id,kind,actor,from_status,to_status,meta,time FROM task_events WHERE task_id=? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |r| {
            let meta_s: Option<String> = r.get(5)?;
            Ok(TaskEventRow {
                task_id: r.get(0)?,
                kind: r.get(1)?,
                actor: r.get(2)?,
                from_status: r.get(3)?,
                to_status: r.get(4)?,
                meta: meta_s
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::json!({})),
                time: col_ts(r, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl ClaimStore for Kernel {
    fn load_task(&self, task_id: &str) -> Result<Option<TaskRow>> {
        self.get_task(task_id)
    }

    fn lock_rows(&self, task_id: &str) -> Result<Vec<LockRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id,locked_by,locked_at,expires_at,released_at FROM task_locks WHERE task_id=?",
        )?;
        let rows = stmt.query_map(params![task_id], lock_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn write_lock(
        &self,
        task_id: &str,
        actor: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        row_exists: bool,
    ) -> Result<LockWrite> {
        let mut conn = self.conn()?;
        // Immediate: take the write lock before reading so the condition below
        // sees the latest committed row.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (now_s, exp_s) = (ts(now), ts(expires_at));
        let changed = if row_exists {
            tx.execute(
                "UPDATE task_locks SET locked_by=?1, locked_at=?2, expires_at=?3, released_at=NULL \
                 WHERE task_id=?4 AND (released_at IS NOT NULL OR expires_at <= ?2 OR locked_by=?1)",
                params![actor, now_s, exp_s, task_id],
            )?
        } else {
            match tx.execute(
                "INSERT INTO task_locks(task_id,locked_by,locked_at,expires_at,released_at) VALUES(?,?,?,?,NULL)",
                params![task_id, actor, now_s, exp_s],
            ) {
                Ok(n) => n,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    0
                }
                Err(e) => return Err(e.into()),
            }
        };
        tx.commit()?;
        Ok(if changed == 1 {
            LockWrite::Written
        } else {
            LockWrite::LostRace
        })
    }

    fn upsert_owner(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO task_assignments(task_id,user_id,role,assigned_at) VALUES(?,?,'owner',?)",
            params![task_id, actor, ts(now)],
        )?;
        Ok(n == 1)
    }

    fn mark_claimed(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET status='claimed', updated_at=? WHERE id=? AND status IN ('open','claimed')",
            params![ts(now), task_id],
        )?;
        Ok(n == 1)
    }

    fn release_claim(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_s = ts(now);
        let released = tx.execute(
            "UPDATE task_locks SET released_at=?1 \
             WHERE task_id=?2 AND locked_by=?3 AND released_at IS NULL AND expires_at > ?1",
            params![now_s, task_id, actor],
        )?;
        if released == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM task_assignments WHERE task_id=? AND user_id=? AND role='owner'",
            params![task_id, actor],
        )?;
        tx.execute(
            "UPDATE tasks SET status='open', updated_at=? WHERE id=? AND status='claimed'",
            params![now_s, task_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn append_task_event(&self, event: &TaskEventRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_events(task_id,kind,actor,from_status,to_status,meta,time) VALUES(?,?,?,?,?,?,?)",
            params![
                event.task_id,
                event.kind,
                event.actor,
                event.from_status,
                event.to_status,
                serde_json::to_string(&event.meta).unwrap_or("{}".into()),
                ts(event.time)
            ],
        )?;
        Ok(())
    }

    fn release_lock(&self, task_id: &str, actor: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE task_locks SET released_at=? WHERE task_id=? AND locked_by=? AND released_at IS NULL",
            params![ts(now), task_id, actor],
        )?;
        Ok(())
    }

    fn delete_owner(&self, task_id: &str, actor: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM task_assignments WHERE task_id=? AND user_id=? AND role='owner'",
            params![task_id, actor],
        )?;
        Ok(())
    }
}
