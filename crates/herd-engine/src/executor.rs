//! The procedure executor.
//!
//! A fixed-size pool of workers plus one scheduler task. The scheduler pops
//! procedures off a FIFO queue and hands them to workers only after their
//! whole lock set has been taken; a procedure whose locks are busy goes back
//! to the tail with a bumped wait counter. Workers run a procedure's jobs
//! strictly in order, checkpointing every transition, and compensate
//! completed jobs in reverse order when a later job fails. Statistics are
//! bumped in the same transaction as the final checkpoint so the counters
//! can never disagree with the audit log.
//!
//! Shutdown is cooperative: the flag is observed between jobs and at every
//! queue wait, running jobs finish their current checkpoint boundary first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use herd_lock::LockManager;
use herd_store::stats::{bump_tx, SCOPE_PROCEDURE};
use herd_store::Store;
use herd_types::{Error, JobState, LockSet};

use crate::action::ActionRegistry;
use crate::procedure::{Job, JobSpec, Procedure};

/// How long the scheduler naps when every queued procedure is lock-blocked,
/// as a backstop for a missed release signal.
const BLOCKED_NAP: Duration = Duration::from_millis(50);

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool size.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

//─────────────────────────────
//  Executor
//─────────────────────────────

struct Inner {
    store: Store,
    locks: LockManager,
    actions: Arc<ActionRegistry>,
    queue: Mutex<VecDeque<Arc<Procedure>>>,
    queue_signal: Notify,
    procedures: DashMap<Uuid, Arc<Procedure>>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    dispatch_tx: mpsc::Sender<Arc<Procedure>>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Arc<Procedure>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

/// Worker pool that turns enqueued procedures into checkpointed job runs.
///
/// Cloning is cheap; all clones share the same queue and registry.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Create an executor. Call [`Executor::start`] before enqueuing work.
    pub fn new(
        store: Store,
        locks: LockManager,
        actions: Arc<ActionRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(workers);
        Self {
            inner: Arc::new(Inner {
                store,
                locks,
                actions,
                queue: Mutex::new(VecDeque::new()),
                queue_signal: Notify::new(),
                procedures: DashMap::new(),
                accepting: AtomicBool::new(true),
                cancel: CancellationToken::new(),
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
                tasks: Mutex::new(Vec::new()),
                workers,
            }),
        }
    }

    /// The lock manager procedures serialize through.
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// The action registry procedures resolve against.
    pub fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    /// Spawn the scheduler and the worker pool. Starting twice is a no-op.
    pub async fn start(&self) {
        let Some(rx) = self.inner.dispatch_rx.lock().await.take() else {
            warn!("executor is already running");
            return;
        };
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks = self.inner.tasks.lock().await;
        for n in 0..self.inner.workers {
            let inner = self.inner.clone();
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move {
                worker_loop(inner, rx, n).await;
            }));
        }
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            scheduler_loop(inner).await;
        }));
        info!(workers = self.inner.workers, "executor started");
    }

    /// Create and enqueue a procedure running a single action.
    pub async fn enqueue_procedure(
        &self,
        action: &str,
        description: &str,
        locks: LockSet,
        args: Value,
    ) -> Result<Arc<Procedure>, Error> {
        self.enqueue(action, description, locks, vec![JobSpec::new(action, args)])
            .await
    }

    /// Create and enqueue a procedure with an explicit job list.
    pub async fn enqueue(
        &self,
        name: &str,
        description: &str,
        locks: LockSet,
        jobs: Vec<JobSpec>,
    ) -> Result<Arc<Procedure>, Error> {
        self.enqueue_with_uuid(
            Uuid::new_v4(),
            name,
            description,
            locks,
            jobs.into_iter().map(Job::new).collect(),
        )
        .await
    }

    /// Enqueue job instances under a known procedure uuid; recovery uses
    /// this to resume an interrupted procedure under its original identity,
    /// with job uuids carried over from the checkpoint log so the existing
    /// rows are upgraded instead of duplicated.
    pub async fn enqueue_with_uuid(
        &self,
        uuid: Uuid,
        name: &str,
        description: &str,
        locks: LockSet,
        jobs: Vec<Job>,
    ) -> Result<Arc<Procedure>, Error> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::Procedure("executor is shutting down".into()));
        }
        if jobs.is_empty() {
            return Err(Error::Procedure(format!(
                "procedure ({name}) has no jobs"
            )));
        }
        for job in &jobs {
            if !self.inner.actions.contains(&job.spec.action) {
                return Err(Error::NotCallable(job.spec.action.clone()));
            }
            if let Some(undo) = &job.spec.undo {
                if !self.inner.actions.contains(&undo.action) {
                    return Err(Error::NotCallable(undo.action.clone()));
                }
            }
        }

        self.inner.store.insert_procedure(uuid, name, &locks).await?;
        let checkpoints: Vec<_> = jobs.iter().map(Job::checkpoint).collect();
        self.inner.store.checkpoint_schedule(uuid, &checkpoints).await?;

        let proc = Procedure::new(uuid, name, locks, jobs);
        proc.record(JobState::Enqueued, true, description.to_string())
            .await;
        self.inner.procedures.insert(uuid, proc.clone());
        self.inner.queue.lock().await.push_back(proc.clone());
        self.inner.queue_signal.notify_one();
        debug!(procedure = %uuid, name, "procedure enqueued");
        Ok(proc)
    }

    /// Attach never-started jobs back onto an existing procedure; used only
    /// by recovery for procedures that crashed before their first job ran.
    pub async fn enqueue_scheduler(
        &self,
        proc_uuid: Uuid,
        jobs: Vec<Job>,
    ) -> Result<Arc<Procedure>, Error> {
        let row = self
            .inner
            .store
            .fetch_procedure(proc_uuid)
            .await?
            .ok_or_else(|| Error::Procedure(format!("procedure ({proc_uuid}) was not found")))?;
        self.enqueue_with_uuid(
            proc_uuid,
            &row.name,
            "Recovering scheduled jobs.",
            row.locks,
            jobs,
        )
        .await
    }

    /// Look up a procedure by uuid.
    pub fn get_procedure(&self, uuid: Uuid) -> Option<Arc<Procedure>> {
        self.inner.procedures.get(&uuid).map(|p| p.clone())
    }

    /// Wait for a set of procedures; fails fast when one is unknown.
    /// Returns whether every procedure succeeded.
    pub async fn wait_for_procedures(&self, uuids: &[Uuid]) -> Result<bool, Error> {
        let mut procs = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            procs.push(self.get_procedure(*uuid).ok_or_else(|| {
                Error::Procedure(format!("procedure ({uuid}) was not found"))
            })?);
        }
        let mut all_ok = true;
        for proc in procs {
            all_ok &= proc.wait().await;
        }
        Ok(all_ok)
    }

    /// Drop terminal procedure handles whose durable rows were purged.
    pub fn forget(&self, uuids: &[Uuid]) {
        for uuid in uuids {
            if let Some(entry) = self.inner.procedures.get(uuid) {
                if !entry.is_terminal() {
                    continue;
                }
            }
            self.inner.procedures.remove(uuid);
        }
    }

    /// Stop accepting work, drain the queue, wait for running procedures,
    /// then stop the pool.
    pub async fn shutdown(&self) {
        info!("executor shutting down");
        self.inner.accepting.store(false, Ordering::SeqCst);

        // Drain: every known procedure reaches a terminal state.
        loop {
            let pending: Vec<Arc<Procedure>> = self
                .inner
                .procedures
                .iter()
                .filter(|p| !p.is_terminal())
                .map(|p| p.clone())
                .collect();
            if pending.is_empty() {
                break;
            }
            for proc in pending {
                proc.wait().await;
            }
        }

        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("executor stopped");
    }
}

//─────────────────────────────
//  Scheduler
//─────────────────────────────

async fn scheduler_loop(inner: Arc<Inner>) {
    let release = inner.locks.release_signal();
    let mut blocked_streak = 0usize;
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let next = inner.queue.lock().await.pop_front();
        match next {
            Some(proc) => {
                if inner.locks.try_acquire(proc.uuid(), proc.locks()).await {
                    blocked_streak = 0;
                    if inner.dispatch_tx.send(proc).await.is_err() {
                        break;
                    }
                } else {
                    proc.wait_count.fetch_add(1, Ordering::Relaxed);
                    let queued = {
                        let mut queue = inner.queue.lock().await;
                        queue.push_back(proc);
                        queue.len()
                    };
                    blocked_streak += 1;
                    if blocked_streak >= queued {
                        // Everything queued is lock-blocked; park until some
                        // holder releases or new work arrives.
                        tokio::select! {
                            _ = inner.cancel.cancelled() => break,
                            _ = release.notified() => {}
                            _ = inner.queue_signal.notified() => {}
                            _ = tokio::time::sleep(BLOCKED_NAP) => {}
                        }
                        blocked_streak = 0;
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.queue_signal.notified() => {}
                }
            }
        }
    }
    debug!("scheduler stopped");
}

//─────────────────────────────
//  Workers
//─────────────────────────────

async fn worker_loop(
    inner: Arc<Inner>,
    rx: Arc<Mutex<mpsc::Receiver<Arc<Procedure>>>>,
    n: usize,
) {
    loop {
        let proc = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = inner.cancel.cancelled() => None,
                proc = rx.recv() => proc,
            }
        };
        let Some(proc) = proc else { break };
        run_procedure(&inner, &proc).await;
    }
    debug!(worker = n, "worker stopped");
}

/// Run one procedure to its terminal state. The caller guarantees the
/// procedure's locks are held; they are released here, after the terminal
/// state is durable.
async fn run_procedure(inner: &Inner, proc: &Arc<Procedure>) {
    let mut completed: Vec<Job> = Vec::new();
    let mut success = true;

    loop {
        let job = proc.queue.lock().await.pop_front();
        let Some(job) = job else { break };

        proc.record(
            JobState::Processing,
            true,
            format!("Executing action ({}).", job.spec.action),
        )
        .await;

        match run_job(inner, proc, &job).await {
            Ok(follow_ups) => {
                let is_final =
                    follow_ups.is_empty() && proc.queue.lock().await.is_empty();
                if let Err(err) =
                    finish_job(inner, proc, &job, true, is_final, &follow_ups).await
                {
                    error!(procedure = %proc.uuid(), error = %err, "cannot finish job");
                    success = false;
                    compensate(inner, proc, &completed).await;
                    break;
                }
                if !follow_ups.is_empty() {
                    // Their checkpoints are durable now; queue them up.
                    proc.queue.lock().await.extend(follow_ups);
                }
                proc.record(
                    JobState::Complete,
                    true,
                    format!("Executed action ({}).", job.spec.action),
                )
                .await;
                completed.push(job);
            }
            Err(err) => {
                warn!(
                    procedure = %proc.uuid(),
                    action = %job.spec.action,
                    error = %err,
                    "job failed, compensating"
                );
                proc.record(
                    JobState::Complete,
                    false,
                    format!("Tried to execute action ({}): {}.", job.spec.action, err),
                )
                .await;
                // The rest of the queue is abandoned; only completed work is
                // compensated.
                proc.queue.lock().await.clear();
                let undo_pending = completed.iter().any(|j| j.spec.undo.is_some());
                if let Err(err) =
                    finish_job(inner, proc, &job, false, !undo_pending, &[]).await
                {
                    error!(procedure = %proc.uuid(), error = %err, "cannot checkpoint job failure");
                }
                success = false;
                compensate(inner, proc, &completed).await;
                break;
            }
        }
    }

    inner.locks.release(proc.uuid()).await;
    proc.set_terminal(success);
    debug!(procedure = %proc.uuid(), success, "procedure terminal");
}

/// Write the `STARTED` checkpoint and run the job's action.
///
/// Returns the follow-up jobs the action produced. They are not yet durable
/// or queued; the caller commits their `SCHEDULED` rows together with this
/// job's `FINISHED` checkpoint so a crash cannot separate the two.
async fn run_job(inner: &Inner, proc: &Arc<Procedure>, job: &Job) -> Result<Vec<Job>, Error> {
    let mut tx = inner.store.begin().await?;
    Store::checkpoint_start_tx(&mut tx, proc.uuid(), &job.checkpoint()).await?;
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

    let action = inner.actions.resolve(&job.spec.action)?;
    let outcome = std::panic::AssertUnwindSafe(action(job.spec.args.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(Error::Procedure(format!(
                "action ({}) panicked",
                job.spec.action
            )))
        })?;

    Ok(outcome.follow_ups.into_iter().map(Job::new).collect())
}

/// Write the `FINISHED` checkpoint, the `SCHEDULED` rows of any follow-up
/// jobs, and - when `is_final` - the statistics increment and the
/// procedure's terminal row, all in one transaction.
async fn finish_job(
    inner: &Inner,
    proc: &Arc<Procedure>,
    job: &Job,
    job_success: bool,
    is_final: bool,
    follow_ups: &[Job],
) -> Result<(), Error> {
    let mut tx = inner.store.begin().await?;
    Store::checkpoint_finish_tx(&mut tx, proc.uuid(), job.uuid, job_success).await?;
    if !follow_ups.is_empty() {
        let checkpoints: Vec<_> = follow_ups.iter().map(Job::checkpoint).collect();
        Store::checkpoint_schedule_tx(&mut tx, proc.uuid(), &checkpoints).await?;
    }
    if is_final {
        let aborted = !job_success;
        bump_tx(
            &mut tx,
            SCOPE_PROCEDURE,
            proc.name(),
            1,
            aborted as i64,
        )
        .await?;
        Store::finish_procedure_tx(&mut tx, proc.uuid(), job_success).await?;
    }
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))
}

/// Run the compensating actions of completed jobs in reverse order.
///
/// Best-effort: an undo that fails is recorded and the rest still run. The
/// last undo's transaction carries the statistics increment and the
/// procedure's terminal row.
async fn compensate(inner: &Inner, proc: &Arc<Procedure>, completed: &[Job]) {
    let undos: Vec<Job> = completed
        .iter()
        .rev()
        .filter_map(|job| {
            job.spec
                .undo
                .as_ref()
                .map(|undo| Job::new(JobSpec::new(undo.action.clone(), undo.args.clone())))
        })
        .collect();
    if undos.is_empty() {
        return;
    }

    let last = undos.len() - 1;
    for (i, undo) in undos.into_iter().enumerate() {
        proc.record(
            JobState::Processing,
            true,
            format!("Executing undo action ({}).", undo.spec.action),
        )
        .await;

        let undo_result = async {
            let mut tx = inner.store.begin().await?;
            Store::checkpoint_start_tx(&mut tx, proc.uuid(), &undo.checkpoint()).await?;
            tx.commit()
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
            let action = inner.actions.resolve(&undo.spec.action)?;
            std::panic::AssertUnwindSafe(action(undo.spec.args.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Procedure(format!(
                        "undo action ({}) panicked",
                        undo.spec.action
                    )))
                })
                .map(|_| ())
        }
        .await;

        let undo_ok = undo_result.is_ok();
        if let Err(err) = &undo_result {
            error!(
                procedure = %proc.uuid(),
                action = %undo.spec.action,
                error = %err,
                "undo action failed"
            );
        }
        // The procedure aborts regardless of how its undos fare.
        let finalize = async {
            let mut tx = inner.store.begin().await?;
            Store::checkpoint_finish_tx(&mut tx, proc.uuid(), undo.uuid, undo_ok).await?;
            if i == last {
                bump_tx(&mut tx, SCOPE_PROCEDURE, proc.name(), 1, 1).await?;
                Store::finish_procedure_tx(&mut tx, proc.uuid(), false).await?;
            }
            tx.commit()
                .await
                .map_err(|e| Error::Persistence(e.to_string()))
        }
        .await;
        if let Err(err) = finalize {
            error!(procedure = %proc.uuid(), error = %err, "cannot checkpoint undo");
        }

        proc.record(
            JobState::Complete,
            undo_ok,
            if undo_ok {
                format!("Executed undo action ({}).", undo.spec.action)
            } else {
                format!("Undo action ({}) failed.", undo.spec.action)
            },
        )
        .await;
    }
}
