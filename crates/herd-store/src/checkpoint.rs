//! Append-only checkpoint log.
//!
//! One row per (procedure, job). A row is written `SCHEDULED` when the job
//! is attached to its procedure, upgraded to `STARTED` in the transaction
//! that reserves the job for execution, and to `FINISHED` when the job
//! completes. Sequences are assigned per procedure at insertion and never
//! reused, so the log for a procedure is strictly monotonic. Recovery reads
//! the log back through [`Store::unfinished`] and [`Store::scheduled`].

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use herd_types::{CheckpointPhase, Error};

use crate::{persistence_err, Store};

/// A durable record of one job's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    /// Procedure the job belongs to.
    pub proc_uuid: Uuid,
    /// The job itself.
    pub job_uuid: Uuid,
    /// Position in the procedure's log; strictly monotonic.
    pub sequence: i64,
    /// Current phase.
    pub phase: CheckpointPhase,
    /// Action the job runs.
    pub do_action: String,
    /// Compensating action, when the job has one.
    pub undo_action: Option<String>,
    /// Serialized action arguments.
    pub args: serde_json::Value,
    /// Outcome, present once `phase` is `Finished`.
    pub success: Option<bool>,
}

/// What gets checkpointed for a job when it is scheduled.
#[derive(Debug, Clone)]
pub struct JobCheckpoint {
    /// The job's identity.
    pub job_uuid: Uuid,
    /// Action the job will run.
    pub do_action: String,
    /// Compensating action, if any.
    pub undo_action: Option<String>,
    /// Serialized action arguments.
    pub args: serde_json::Value,
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<CheckpointRow, Error> {
    let proc_uuid: String = row.try_get("proc_uuid").map_err(persistence_err)?;
    let job_uuid: String = row.try_get("job_uuid").map_err(persistence_err)?;
    let phase: String = row.try_get("phase").map_err(persistence_err)?;
    let args: String = row.try_get("args_blob").map_err(persistence_err)?;
    let success: Option<i64> = row.try_get("success").map_err(persistence_err)?;
    Ok(CheckpointRow {
        proc_uuid: Uuid::parse_str(&proc_uuid)
            .map_err(|e| Error::Persistence(format!("bad proc uuid in checkpoints: {e}")))?,
        job_uuid: Uuid::parse_str(&job_uuid)
            .map_err(|e| Error::Persistence(format!("bad job uuid in checkpoints: {e}")))?,
        sequence: row.try_get("sequence").map_err(persistence_err)?,
        phase: CheckpointPhase::parse(&phase)?,
        do_action: row.try_get("do_action").map_err(persistence_err)?,
        undo_action: row.try_get("undo_action").map_err(persistence_err)?,
        args: serde_json::from_str(&args)
            .map_err(|e| Error::Persistence(format!("bad args blob in checkpoints: {e}")))?,
        success: success.map(|s| s != 0),
    })
}

async fn next_sequence(conn: &mut SqliteConnection, proc_uuid: Uuid) -> Result<i64, Error> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(sequence), -1) + 1 AS next FROM checkpoints WHERE proc_uuid = ?",
    )
    .bind(proc_uuid.to_string())
    .fetch_one(conn)
    .await
    .map_err(persistence_err)?;
    row.try_get("next").map_err(persistence_err)
}

impl Store {
    /// Atomically write `SCHEDULED` rows for jobs not yet checkpointed.
    pub async fn checkpoint_schedule(
        &self,
        proc_uuid: Uuid,
        jobs: &[JobCheckpoint],
    ) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        Self::checkpoint_schedule_tx(&mut tx, proc_uuid, jobs).await?;
        tx.commit().await.map_err(persistence_err)
    }

    /// Write `SCHEDULED` rows inside an open transaction, skipping jobs that
    /// already have a checkpoint.
    ///
    /// The executor commits a job's follow-ups through here, in the same
    /// transaction as that job's `FINISHED` row, so the log can never show
    /// an elder job finished-pending while a younger job of the same
    /// procedure is already durable.
    pub async fn checkpoint_schedule_tx(
        conn: &mut SqliteConnection,
        proc_uuid: Uuid,
        jobs: &[JobCheckpoint],
    ) -> Result<(), Error> {
        for job in jobs {
            let exists = sqlx::query(
                "SELECT 1 FROM checkpoints WHERE proc_uuid = ? AND job_uuid = ?",
            )
            .bind(proc_uuid.to_string())
            .bind(job.job_uuid.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(persistence_err)?;
            if exists.is_some() {
                continue;
            }
            let sequence = next_sequence(&mut *conn, proc_uuid).await?;
            sqlx::query(
                "INSERT INTO checkpoints \
                 (proc_uuid, job_uuid, sequence, phase, do_action, undo_action, args_blob) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(proc_uuid.to_string())
            .bind(job.job_uuid.to_string())
            .bind(sequence)
            .bind(CheckpointPhase::Scheduled.as_str())
            .bind(&job.do_action)
            .bind(&job.undo_action)
            .bind(job.args.to_string())
            .execute(&mut *conn)
            .await
            .map_err(persistence_err)?;
        }
        Ok(())
    }

    /// Write (or upgrade to) a `STARTED` checkpoint inside the transaction
    /// that reserves the job.
    pub async fn checkpoint_start_tx(
        conn: &mut SqliteConnection,
        proc_uuid: Uuid,
        job: &JobCheckpoint,
    ) -> Result<(), Error> {
        let upgraded = sqlx::query(
            "UPDATE checkpoints SET phase = ? \
             WHERE proc_uuid = ? AND job_uuid = ? AND phase = ?",
        )
        .bind(CheckpointPhase::Started.as_str())
        .bind(proc_uuid.to_string())
        .bind(job.job_uuid.to_string())
        .bind(CheckpointPhase::Scheduled.as_str())
        .execute(&mut *conn)
        .await
        .map_err(persistence_err)?;
        if upgraded.rows_affected() > 0 {
            return Ok(());
        }
        let sequence = next_sequence(conn, proc_uuid).await?;
        sqlx::query(
            "INSERT INTO checkpoints \
             (proc_uuid, job_uuid, sequence, phase, do_action, undo_action, args_blob) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(proc_uuid.to_string())
        .bind(job.job_uuid.to_string())
        .bind(sequence)
        .bind(CheckpointPhase::Started.as_str())
        .bind(&job.do_action)
        .bind(&job.undo_action)
        .bind(job.args.to_string())
        .execute(conn)
        .await
        .map_err(persistence_err)?;
        Ok(())
    }

    /// Write the `FINISHED` checkpoint for a job inside an open transaction.
    pub async fn checkpoint_finish_tx(
        conn: &mut SqliteConnection,
        proc_uuid: Uuid,
        job_uuid: Uuid,
        success: bool,
    ) -> Result<(), Error> {
        let done = sqlx::query(
            "UPDATE checkpoints SET phase = ?, success = ? \
             WHERE proc_uuid = ? AND job_uuid = ?",
        )
        .bind(CheckpointPhase::Finished.as_str())
        .bind(success as i64)
        .bind(proc_uuid.to_string())
        .bind(job_uuid.to_string())
        .execute(conn)
        .await
        .map_err(persistence_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::Procedure(format!(
                "no checkpoint to finish for job ({job_uuid})"
            )));
        }
        Ok(())
    }

    /// Close a stale `STARTED` checkpoint that recovery has taken over,
    /// leaving its outcome unset.
    pub async fn checkpoint_mark_recovered(
        &self,
        proc_uuid: Uuid,
        job_uuid: Uuid,
    ) -> Result<(), Error> {
        self.retry("mark checkpoint recovered", || async {
            sqlx::query(
                "UPDATE checkpoints SET phase = ? WHERE proc_uuid = ? AND job_uuid = ?",
            )
            .bind(CheckpointPhase::Finished.as_str())
            .bind(proc_uuid.to_string())
            .bind(job_uuid.to_string())
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Checkpoints of jobs that were started but never finished, in
    /// procedures that have no terminal row; these were interrupted mid-job
    /// and need recovery. Jobs run serially, so a procedure contributes at
    /// most one row here - its last checkpoint. Ordered by original enqueue
    /// time.
    pub async fn unfinished(&self) -> Result<Vec<CheckpointRow>, Error> {
        let rows = self
            .retry("list unfinished checkpoints", || async {
                sqlx::query(
                    "SELECT c.* FROM checkpoints c \
                     JOIN procedures p ON p.uuid = c.proc_uuid \
                     WHERE c.phase = 'STARTED' AND p.finished_at IS NULL \
                     ORDER BY p.started_at, c.proc_uuid, c.sequence",
                )
                .fetch_all(self.pool())
                .await
            })
            .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    /// `SCHEDULED` checkpoints of non-terminal procedures that are not
    /// mid-job; these need re-enqueueing. Together with [`Store::unfinished`]
    /// this covers every procedure that has not reached a terminal state:
    /// a procedure is either mid-job (a `STARTED` row exists) or all of its
    /// pending work sits in `SCHEDULED` rows. Leftover `SCHEDULED` rows of
    /// terminal procedures - the queue a failed procedure abandoned - stay
    /// dead. Ordered by original enqueue time, then sequence.
    pub async fn scheduled(&self) -> Result<Vec<CheckpointRow>, Error> {
        let rows = self
            .retry("list scheduled checkpoints", || async {
                sqlx::query(
                    "SELECT c.* FROM checkpoints c \
                     JOIN procedures p ON p.uuid = c.proc_uuid \
                     WHERE c.phase = 'SCHEDULED' \
                       AND p.finished_at IS NULL \
                       AND c.proc_uuid NOT IN ( \
                           SELECT proc_uuid FROM checkpoints WHERE phase = 'STARTED') \
                     ORDER BY p.started_at, c.proc_uuid, c.sequence",
                )
                .fetch_all(self.pool())
                .await
            })
            .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    /// Full log for one procedure, ordered by sequence.
    pub async fn checkpoints_for(&self, proc_uuid: Uuid) -> Result<Vec<CheckpointRow>, Error> {
        let rows = self
            .retry("list procedure checkpoints", || async {
                sqlx::query(
                    "SELECT * FROM checkpoints WHERE proc_uuid = ? ORDER BY sequence",
                )
                .bind(proc_uuid.to_string())
                .fetch_all(self.pool())
                .await
            })
            .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(action: &str, undo: Option<&str>) -> JobCheckpoint {
        JobCheckpoint {
            job_uuid: Uuid::new_v4(),
            do_action: action.to_string(),
            undo_action: undo.map(str::to_string),
            args: json!(["g1"]),
        }
    }

    async fn store_with_procedure(proc_uuid: Uuid) -> Store {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_procedure(proc_uuid, "test.checkpoints", &herd_types::LockSet::new())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn schedule_start_finish_round_trip() {
        let proc_uuid = Uuid::new_v4();
        let store = store_with_procedure(proc_uuid).await;
        let first = job("group.promote", Some("group.demote"));
        let second = job("group.activate", None);

        store
            .checkpoint_schedule(proc_uuid, &[first.clone(), second.clone()])
            .await
            .unwrap();
        // Re-scheduling is a no-op for already checkpointed jobs.
        store
            .checkpoint_schedule(proc_uuid, &[first.clone()])
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::checkpoint_start_tx(&mut tx, proc_uuid, &first)
            .await
            .unwrap();
        Store::checkpoint_finish_tx(&mut tx, proc_uuid, first.job_uuid, true)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let log = store.checkpoints_for(proc_uuid).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].phase, CheckpointPhase::Finished);
        assert_eq!(log[0].success, Some(true));
        assert_eq!(log[1].phase, CheckpointPhase::Scheduled);
        // Sequence is strictly monotonic.
        assert!(log[0].sequence < log[1].sequence);
    }

    #[tokio::test]
    async fn unfinished_reports_interrupted_procedures() {
        let proc_uuid = Uuid::new_v4();
        let store = store_with_procedure(proc_uuid).await;
        let interrupted = job("group.promote", Some("group.demote"));
        let sibling = job("group.activate", None);

        store
            .checkpoint_schedule(proc_uuid, &[interrupted.clone(), sibling.clone()])
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        Store::checkpoint_start_tx(&mut tx, proc_uuid, &interrupted)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // The started row is reported even though a younger scheduled
        // sibling holds the highest sequence.
        let pending = store.unfinished().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_uuid, interrupted.job_uuid);
        assert_eq!(pending[0].undo_action.as_deref(), Some("group.demote"));
        // A mid-job procedure is never handed to the re-enqueue pass.
        assert!(store.scheduled().await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        Store::checkpoint_finish_tx(&mut tx, proc_uuid, interrupted.job_uuid, false)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_follow_ups_of_advanced_procedures_are_scheduled() {
        // The crash window right after a job's FINISHED row and its
        // follow-up's SCHEDULED row committed together.
        let proc_uuid = Uuid::new_v4();
        let store = store_with_procedure(proc_uuid).await;
        let done = job("group.add", None);
        let follow_up = job("ha.configure_server", None);

        store
            .checkpoint_schedule(proc_uuid, &[done.clone()])
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        Store::checkpoint_start_tx(&mut tx, proc_uuid, &done).await.unwrap();
        Store::checkpoint_finish_tx(&mut tx, proc_uuid, done.job_uuid, true)
            .await
            .unwrap();
        Store::checkpoint_schedule_tx(&mut tx, proc_uuid, &[follow_up.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Not mid-job, not terminal: the pending follow-up must surface.
        assert!(store.unfinished().await.unwrap().is_empty());
        let pending = store.scheduled().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_uuid, follow_up.job_uuid);

        // Once the procedure is terminal, leftover scheduled rows stay dead.
        let mut tx = store.begin().await.unwrap();
        Store::finish_procedure_tx(&mut tx, proc_uuid, false).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.scheduled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_reports_never_started_procedures() {
        let never_started = Uuid::new_v4();
        let store = store_with_procedure(never_started).await;
        store
            .checkpoint_schedule(never_started, &[job("a", None), job("b", None)])
            .await
            .unwrap();

        let started = Uuid::new_v4();
        store
            .insert_procedure(started, "test.started", &herd_types::LockSet::new())
            .await
            .unwrap();
        let running = job("c", None);
        store
            .checkpoint_schedule(started, &[running.clone()])
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        Store::checkpoint_start_tx(&mut tx, started, &running)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let pending = store.scheduled().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|c| c.proc_uuid == never_started));
        assert!(pending[0].sequence < pending[1].sequence);
    }
}
