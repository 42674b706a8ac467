//! Startup crash recovery.
//!
//! Replays the checkpoint log before the failure detector and the RPC
//! surface come up, so recovered work never competes with new work. A
//! procedure interrupted mid-job either has its compensating action run (and
//! is then marked permanently aborted) or, when the job had no compensating
//! action, is re-run under its original identity together with any jobs of
//! the same procedure that never started. Procedures whose pending work is
//! all still `SCHEDULED` - never started at all, or crashed right after a
//! job's finish committed along with its follow-ups - are re-enqueued in
//! their original order.

use tracing::{error, info, warn};

use herd_store::stats::{bump_tx, SCOPE_PROCEDURE};
use herd_store::{CheckpointRow, Store};
use herd_types::{CheckpointPhase, Error};

use crate::executor::Executor;
use crate::procedure::{Job, JobSpec};

fn job_from_row(row: &CheckpointRow) -> Job {
    let mut spec = JobSpec::new(row.do_action.clone(), row.args.clone());
    if let Some(undo) = &row.undo_action {
        spec = spec.with_undo(undo.clone(), row.args.clone());
    }
    // Keeping the original job uuid upgrades the existing checkpoint row
    // instead of leaving it behind as a permanently scheduled orphan.
    Job::with_uuid(row.job_uuid, spec)
}

/// Replay the checkpoint log. Returns `true` when any recovery step failed;
/// callers may refuse to open the RPC surface on a hard failure.
pub async fn recover(executor: &Executor, store: &Store) -> bool {
    let mut failed = false;

    let unfinished = match store.unfinished().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "cannot read unfinished checkpoints");
            return true;
        }
    };
    info!(count = unfinished.len(), "recovering interrupted procedures");
    for checkpoint in unfinished {
        if recover_interrupted(executor, store, &checkpoint).await.is_err() {
            failed = true;
        }
    }

    let scheduled = match store.scheduled().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "cannot read scheduled checkpoints");
            return true;
        }
    };
    info!(count = scheduled.len(), "re-enqueueing scheduled procedures");
    // Rows arrive ordered by procedure, then sequence; chunk them back into
    // per-procedure job lists.
    let mut current: Vec<CheckpointRow> = Vec::new();
    for row in scheduled {
        if let Some(head) = current.first() {
            if head.proc_uuid != row.proc_uuid {
                let batch = std::mem::take(&mut current);
                if reenqueue_scheduled(executor, &batch).await.is_err() {
                    failed = true;
                }
            }
        }
        current.push(row);
    }
    if !current.is_empty() && reenqueue_scheduled(executor, &current).await.is_err() {
        failed = true;
    }

    failed
}

/// Recover one procedure whose last checkpoint is `STARTED`.
async fn recover_interrupted(
    executor: &Executor,
    store: &Store,
    checkpoint: &CheckpointRow,
) -> Result<(), Error> {
    let row = store
        .fetch_procedure(checkpoint.proc_uuid)
        .await?
        .ok_or_else(|| {
            Error::Procedure(format!(
                "checkpoint references unknown procedure ({})",
                checkpoint.proc_uuid
            ))
        })?;

    if let Some(undo_action) = &checkpoint.undo_action {
        // Compensate on the same locks, then mark the original permanently
        // aborted whatever the compensation did.
        let undo_ok = match executor
            .enqueue_procedure(
                undo_action,
                &format!("Recovering ({undo_action})."),
                row.locks.clone(),
                checkpoint.args.clone(),
            )
            .await
        {
            Ok(proc) => proc.wait().await,
            Err(err) => {
                error!(
                    procedure = %checkpoint.proc_uuid,
                    action = %undo_action,
                    error = %err,
                    "cannot enqueue recovery undo"
                );
                false
            }
        };
        if !undo_ok {
            warn!(
                procedure = %checkpoint.proc_uuid,
                action = %undo_action,
                "recovery undo failed"
            );
        }
        abort_interrupted(store, checkpoint, &row.name).await?;
        if undo_ok {
            Ok(())
        } else {
            Err(Error::Procedure(format!(
                "recovery undo ({undo_action}) failed"
            )))
        }
    } else {
        // No compensating action: consume the stale checkpoint and re-run
        // the job under the original procedure identity. Jobs of the same
        // procedure that never started resume behind the re-run, so the
        // replay ends in the same terminal state as a crash-free run.
        store
            .checkpoint_mark_recovered(checkpoint.proc_uuid, checkpoint.job_uuid)
            .await?;
        let mut jobs = vec![Job::new(JobSpec::new(
            checkpoint.do_action.clone(),
            checkpoint.args.clone(),
        ))];
        jobs.extend(
            store
                .checkpoints_for(checkpoint.proc_uuid)
                .await?
                .iter()
                .filter(|pending| pending.phase == CheckpointPhase::Scheduled)
                .map(job_from_row),
        );
        let proc = executor
            .enqueue_with_uuid(
                checkpoint.proc_uuid,
                &row.name,
                &format!("Recovering ({}).", checkpoint.do_action),
                row.locks.clone(),
                jobs,
            )
            .await?;
        if proc.wait().await {
            Ok(())
        } else {
            Err(Error::Procedure(format!(
                "recovery of ({}) failed",
                checkpoint.do_action
            )))
        }
    }
}

/// Close the books on an interrupted procedure: consume its stale checkpoint
/// and record the abort, counters and audit row in one transaction.
async fn abort_interrupted(
    store: &Store,
    checkpoint: &CheckpointRow,
    name: &str,
) -> Result<(), Error> {
    store
        .checkpoint_mark_recovered(checkpoint.proc_uuid, checkpoint.job_uuid)
        .await?;
    let mut tx = store.begin().await?;
    bump_tx(&mut tx, SCOPE_PROCEDURE, name, 1, 1).await?;
    Store::finish_procedure_tx(&mut tx, checkpoint.proc_uuid, false).await?;
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
}

/// Re-enqueue the pending jobs of one procedure that was scheduled but
/// never reached a started job.
async fn reenqueue_scheduled(
    executor: &Executor,
    batch: &[CheckpointRow],
) -> Result<(), Error> {
    let proc_uuid = batch[0].proc_uuid;
    let jobs: Vec<Job> = batch.iter().map(job_from_row).collect();
    match executor.enqueue_scheduler(proc_uuid, jobs).await {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(procedure = %proc_uuid, error = %err, "cannot re-enqueue scheduled procedure");
            Err(err)
        }
    }
}
