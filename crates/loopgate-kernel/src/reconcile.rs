use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{ts, Kernel};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub locks_released: usize,
    pub assignments_removed: usize,
    pub tasks_reopened: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.locks_released == 0 && self.assignments_removed == 0 && self.tasks_reopened == 0
    }
}

impl Kernel {
    /// Repair lock/assignment/task combinations a claim can only leave behind
    /// when one of its compensating writes failed.
    ///
    /// Rows younger than `grace` are skipped so in-flight claims and releases
    /// are never touched.
    pub fn reconcile(&self, now: DateTime<Utc>, grace: Duration) -> Result<ReconcileReport> {
        let now_s = ts(now);
        let cutoff = ts(now - grace);
        let mut report = ReconcileReport::default();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Active locks on tasks that never reached `claimed`.
        let stale: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT l.task_id, l.locked_by FROM task_locks l JOIN tasks t ON t.id = l.task_id \
                 WHERE t.status = 'open' AND l.released_at IS NULL AND l.expires_at > ?1 AND l.locked_at <= ?2",
            )?;
            let rows = stmt.query_map(params![now_s, cutoff], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (task_id, holder) in &stale {
            report.locks_released += tx.execute(
                "UPDATE task_locks SET released_at=? WHERE task_id=? AND released_at IS NULL",
                params![now_s, task_id],
            )?;
            report.assignments_removed += tx.execute(
                "DELETE FROM task_assignments WHERE task_id=? AND user_id=? AND role='owner'",
                params![task_id, holder],
            )?;
        }

        // Owners of open tasks nobody holds.
        report.assignments_removed += tx.execute(
            "DELETE FROM task_assignments WHERE role='owner' AND assigned_at <= ?2 \
             AND task_id IN (SELECT id FROM tasks WHERE status='open') \
             AND NOT EXISTS (SELECT 1 FROM task_locks l WHERE l.task_id = task_assignments.task_id \
                             AND l.released_at IS NULL AND l.expires_at > ?1)",
            params![now_s, cutoff],
        )?;

        // Owners left behind after another actor took over an expired lease.
        report.assignments_removed += tx.execute(
            "DELETE FROM task_assignments WHERE role='owner' AND assigned_at <= ?2 \
             AND task_id IN (SELECT id FROM tasks WHERE status='claimed') \
             AND EXISTS (SELECT 1 FROM task_locks l WHERE l.task_id = task_assignments.task_id \
                         AND l.released_at IS NULL AND l.expires_at > ?1 \
                         AND l.locked_by <> task_assignments.user_id)",
            params![now_s, cutoff],
        )?;

        // Claimed tasks without an unreleased lock.
        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM tasks t WHERE t.status = 'claimed' AND t.updated_at <= ?1 \
                 AND NOT EXISTS (SELECT 1 FROM task_locks l WHERE l.task_id = t.id AND l.released_at IS NULL)",
            )?;
            let rows = stmt.query_map(params![cutoff], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for task_id in &orphaned {
            report.tasks_reopened += tx.execute(
                "UPDATE tasks SET status='open', updated_at=? WHERE id=? AND status='claimed'",
                params![now_s, task_id],
            )?;
            tx.execute(
                "INSERT INTO task_events(task_id,kind,actor,from_status,to_status,meta,time) VALUES(?,'reconciled',NULL,'claimed','open','{}',?)",
                params![task_id, now_s],
            )?;
        }

        tx.commit()?;
        if report.is_clean() {
            tracing::debug!("claim reconcile found nothing to repair");
        } else {
            tracing::info!(
                locks_released = report.locks_released,
                assignments_removed = report.assignments_removed,
                tasks_reopened = report.tasks_reopened,
                "claim reconcile repaired store"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::at;
    use crate::{ClaimCoordinator, ClaimRequest, ClaimStore, TaskStatus};

    fn claim(coord: &ClaimCoordinator<Kernel>, task: &str, actor: &str, now: DateTime<Utc>) {
        let out = coord
            .claim(&ClaimRequest {
                task_id: task.into(),
                actor: actor.into(),
                user_agent: None,
                ip_address: None,
                now,
            })
            .expect("claim");
        assert!(out.is_claimed());
    }

    #[test]
    fn repairs_half_finished_claims_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let k = Kernel::open(dir.path()).expect("open");
        for id in ["t-a", "t-b", "t-c", "t-d", "t-e", "t-f"] {
            k.create_task(id, "task", None, at(8, 0)).expect("create");
        }
        let coord = ClaimCoordinator::new(k.clone());

        // Lock and owner written, task never marked claimed.
        k.write_lock("t-a", "ana", at(9, 0), at(9, 30), false).expect("lock");
        k.upsert_owner("t-a", "ana", at(9, 0)).expect("owner");
        // Lock released but owner row survived.
        k.write_lock("t-b", "bo", at(9, 0), at(9, 30), false).expect("lock");
        k.release_lock("t-b", "bo", at(9, 0)).expect("release");
        k.upsert_owner("t-b", "bo", at(9, 0)).expect("owner");
        // Claimed with no lock at all.
        k.mark_claimed("t-c", at(9, 0)).expect("mark");
        // Too recent to touch.
        k.write_lock("t-d", "ana", at(9, 9), at(9, 39), false).expect("lock");
        // Healthy claim.
        claim(&coord, "t-e", "ana", at(9, 0));
        // Takeover leaves the previous owner behind.
        claim(&coord, "t-f", "ana", at(8, 0));
        claim(&coord, "t-f", "bo", at(8, 50));

        let report = k.reconcile(at(9, 10), Duration::minutes(2)).expect("reconcile");
        assert_eq!(
            report,
            ReconcileReport {
                locks_released: 1,
                assignments_removed: 3,
                tasks_reopened: 1,
            }
        );

        assert!(!k.task_lock("t-a").expect("lock").expect("row").is_active(at(9, 10)));
        assert!(k.assignments("t-a").expect("rows").is_empty());
        assert!(k.assignments("t-b").expect("rows").is_empty());
        assert_eq!(k.get_task("t-c").expect("get").expect("task").status, TaskStatus::Open);
        assert!(k.task_lock("t-d").expect("lock").expect("row").is_active(at(9, 10)));
        assert_eq!(k.assignments("t-e").expect("rows").len(), 1);
        let f_owners = k.assignments("t-f").expect("rows");
        assert_eq!(f_owners.len(), 1);
        assert_eq!(f_owners[0].user_id, "bo");

        let again = k.reconcile(at(9, 10), Duration::minutes(2)).expect("again");
        assert!(again.is_clean());
    }
}
