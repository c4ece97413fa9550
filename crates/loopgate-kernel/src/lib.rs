use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod claims;
mod reconcile;
mod tasks;

pub use claims::{
    ClaimCoordinator, ClaimError, ClaimOutcome, ClaimRequest, ClaimStep, ClaimStore, LockWrite,
    RejectReason, ReleaseOutcome, DEFAULT_LEASE_MINUTES,
};
pub use reconcile::ReconcileReport;
pub use tasks::{AssignmentRow, LockRow, RenewalRow, TaskEventRow, TaskRow, TaskStatus};

/// Shared SQLite store. Every call opens its own connection, so the handle is
/// cheap to clone into blocking tasks.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRow {
    pub id: i64,
    pub decision_id: String,
    pub loop_id: String,
    pub capacity: Option<String>,
    pub blocked: bool,
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub created: String,
}

/// One decision as handed to [`Kernel::record_decision`].
#[derive(Debug, Clone)]
pub struct NewDecision<'a> {
    pub decision_id: &'a str,
    pub loop_id: &'a str,
    pub capacity: Option<&'a str>,
    pub blocked: bool,
    pub fingerprint: &'a str,
    pub payload: &'a serde_json::Value,
    pub at: DateTime<Utc>,
}

/// One guardrail evaluation against a task.
#[derive(Debug, Clone)]
pub struct ActuationAttempt<'a> {
    pub task_id: &'a str,
    pub actor: &'a str,
    pub change_kind: &'a str,
    pub result: &'a str,
    pub evaluation_ms: f64,
    pub payload: &'a serde_json::Value,
    pub at: DateTime<Utc>,
}

/// A rule that fired during an [`ActuationAttempt`].
#[derive(Debug, Clone)]
pub struct Enforcement<'a> {
    pub rule: &'a str,
    pub effect: &'a str,
    pub message: &'a str,
}

/// Millisecond RFC3339 in UTC. Fixed width, so lexical order is time order.
pub fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow!("bad timestamp {s:?}: {e}"))?
        .with_timezone(&Utc))
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("loopgate.sqlite");
        // Busy timeout (default 5000ms; override with LOOPGATE_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("LOOPGATE_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path,
            busy: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %kernel.db_path.display(), "kernel store ready");
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'open',
              source TEXT,
              renewals INTEGER NOT NULL DEFAULT 0,
              renewed_at TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            -- One row per task; the key is what serializes competing claims
            CREATE TABLE IF NOT EXISTS task_locks (
              task_id TEXT PRIMARY KEY,
              locked_by TEXT NOT NULL,
              locked_at TEXT NOT NULL,
              expires_at TEXT NOT NULL,
              released_at TEXT
            );

            CREATE TABLE IF NOT EXISTS task_assignments (
              task_id TEXT NOT NULL,
              user_id TEXT NOT NULL,
              role TEXT NOT NULL DEFAULT 'owner',
              assigned_at TEXT NOT NULL,
              PRIMARY KEY (task_id, user_id, role)
            );

            CREATE TABLE IF NOT EXISTS task_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              actor TEXT,
              from_status TEXT,
              to_status TEXT,
              meta TEXT,
              time TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id);

            CREATE TABLE IF NOT EXISTS task_renewals (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id TEXT NOT NULL,
              renewal_no INTEGER NOT NULL,
              requires_evaluation INTEGER NOT NULL,
              actor TEXT,
              time TEXT NOT NULL
            );

            -- Append-only; duplicate fingerprints are expected
            CREATE TABLE IF NOT EXISTS decisions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              decision_id TEXT NOT NULL,
              loop_id TEXT NOT NULL,
              capacity TEXT,
              blocked INTEGER NOT NULL,
              fingerprint TEXT NOT NULL,
              payload TEXT NOT NULL,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_fp ON decisions(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_decisions_loop ON decisions(loop_id);

            CREATE TABLE IF NOT EXISTS actuation_attempts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id TEXT NOT NULL,
              actor TEXT NOT NULL,
              change_kind TEXT NOT NULL,
              result TEXT NOT NULL,
              evaluation_ms REAL NOT NULL,
              payload TEXT,
              time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guardrail_enforcements (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              attempt_id INTEGER NOT NULL,
              task_id TEXT NOT NULL,
              rule TEXT NOT NULL,
              effect TEXT NOT NULL,
              message TEXT NOT NULL,
              time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn append_event(&self, env: &loopgate_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&env.payload).unwrap_or("{}".to_string());
        conn.execute(
            "INSERT INTO events(time,kind,payload) VALUES (?,?,?)",
            params![env.time, env.kind, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id,time,kind,payload FROM events ORDER BY id DESC LIMIT ?")?;
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_s: String = row.get(3)?;
            out.push(EventRow {
                id: row.get(0)?,
                time: row.get(1)?,
                kind: row.get(2)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        // Ascending for replay
        out.reverse();
        Ok(out)
    }

    /// Append one decision row. Every attempt is kept; fingerprints repeat.
    pub fn record_decision(&self, d: &NewDecision<'_>) -> Result<i64> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(d.payload).unwrap_or("{}".into());
        conn.execute(
            "INSERT INTO decisions(decision_id,loop_id,capacity,blocked,fingerprint,payload,created) VALUES(?,?,?,?,?,?,?)",
            params![
                d.decision_id,
                d.loop_id,
                d.capacity,
                d.blocked,
                d.fingerprint,
                payload,
                ts(d.at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn decisions_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<DecisionRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,decision_id,loop_id,capacity,blocked,fingerprint,payload,created FROM decisions WHERE fingerprint=? ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![fingerprint])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let payload_s: String = r.get(6)?;
            out.push(DecisionRow {
                id: r.get(0)?,
                decision_id: r.get(1)?,
                loop_id: r.get(2)?,
                capacity: r.get(3)?,
                blocked: r.get(4)?,
                fingerprint: r.get(5)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
                created: r.get(7)?,
            });
        }
        Ok(out)
    }

    /// Log one attempt and one enforcement row per fired rule, atomically.
    pub fn record_actuation(
        &self,
        attempt: &ActuationAttempt<'_>,
        fired: &[Enforcement<'_>],
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let at = ts(attempt.at);
        let payload = serde_json::to_string(attempt.payload).unwrap_or("{}".into());
        tx.execute(
            "INSERT INTO actuation_attempts(task_id,actor,change_kind,result,evaluation_ms,payload,time) VALUES(?,?,?,?,?,?,?)",
            params![
                attempt.task_id,
                attempt.actor,
                attempt.change_kind,
                attempt.result,
                attempt.evaluation_ms,
                payload,
                at
            ],
        )?;
        let attempt_id = tx.last_insert_rowid();
        for e in fired {
            tx.execute(
                "INSERT INTO guardrail_enforcements(attempt_id,task_id,rule,effect,message,time) VALUES(?,?,?,?,?,?)",
                params![attempt_id, attempt.task_id, e.rule, e.effect, e.message, at],
            )?;
        }
        tx.commit()?;
        Ok(attempt_id)
    }

    pub fn count_enforcements(&self, attempt_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM guardrail_enforcements WHERE attempt_id=?",
            params![attempt_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn append_event_async(&self, env: &loopgate_events::Envelope) -> Result<i64> {
        let k = self.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || k.append_event(&env))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn reconcile_async(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<ReconcileReport> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.reconcile(now, grace))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_task_async(&self, id: &str) -> Result<Option<TaskRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_task(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn create_task_async(
        &self,
        id: &str,
        title: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let k = self.clone();
        let (id, title, source) = (id.to_string(), title.to_string(), source.map(str::to_string));
        tokio::task::spawn_blocking(move || k.create_task(&id, &title, source.as_deref(), now))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn renew_task_async(
        &self,
        id: &str,
        actor: &str,
        now: DateTime<Utc>,
        renewal_limit: u32,
        evaluation_after: u32,
    ) -> Result<Option<RenewalRow>> {
        let k = self.clone();
        let (id, actor) = (id.to_string(), actor.to_string());
        tokio::task::spawn_blocking(move || {
            k.renew_task(&id, &actor, now, renewal_limit, evaluation_after)
        })
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
