//! Procedures and their jobs.
//!
//! A procedure is a durable, serially executed sequence of jobs. The handle
//! here is the in-memory cache of what the store already knows; it is owned
//! by the executor's registry and mutated only by the worker running it.
//! Waiters park on a watch channel that flips exactly once, when the
//! procedure reaches its terminal state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use herd_store::JobCheckpoint;
use herd_types::{Error, JobState, LockSet, StatusRecord};

//─────────────────────────────
//  Job specifications
//─────────────────────────────

/// The compensating half of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoSpec {
    /// Action to run if a later job in the procedure fails.
    pub action: String,
    /// Arguments for the compensating action.
    pub args: Value,
}

/// What a job will run, serializable for checkpointing.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// Action name, resolved through the action registry.
    pub action: String,
    /// JSON arguments handed to the action.
    pub args: Value,
    /// Compensating action, when the job has one.
    pub undo: Option<UndoSpec>,
}

impl JobSpec {
    /// A job with no compensating action.
    pub fn new(action: impl Into<String>, args: Value) -> Self {
        Self {
            action: action.into(),
            args,
            undo: None,
        }
    }

    /// Attach a compensating action.
    pub fn with_undo(mut self, action: impl Into<String>, args: Value) -> Self {
        self.undo = Some(UndoSpec {
            action: action.into(),
            args,
        });
        self
    }
}

/// A job instance attached to a procedure.
#[derive(Debug, Clone)]
pub struct Job {
    /// The job's identity.
    pub uuid: Uuid,
    /// What the job runs.
    pub spec: JobSpec,
}

impl Job {
    /// Create a job instance from its specification.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            spec,
        }
    }

    /// Resurrect a job under a known uuid (recovery path).
    pub fn with_uuid(uuid: Uuid, spec: JobSpec) -> Self {
        Self { uuid, spec }
    }

    /// The durable form of this job.
    pub fn checkpoint(&self) -> JobCheckpoint {
        JobCheckpoint {
            job_uuid: self.uuid,
            do_action: self.spec.action.clone(),
            undo_action: self.spec.undo.as_ref().map(|u| u.action.clone()),
            args: self.spec.args.clone(),
        }
    }
}

//─────────────────────────────
//  Procedure handle
//─────────────────────────────

/// In-memory handle to a running or finished procedure.
pub struct Procedure {
    uuid: Uuid,
    name: String,
    locks: LockSet,
    pub(crate) queue: Mutex<VecDeque<Job>>,
    pub(crate) wait_count: std::sync::atomic::AtomicU32,
    status: RwLock<Vec<StatusRecord>>,
    terminal_tx: watch::Sender<Option<bool>>,
    terminal_rx: watch::Receiver<Option<bool>>,
}

impl Procedure {
    /// Create a procedure handle with its initial jobs queued.
    pub fn new(uuid: Uuid, name: impl Into<String>, locks: LockSet, jobs: Vec<Job>) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = watch::channel(None);
        let name = name.into();
        let proc = Arc::new(Self {
            uuid,
            name,
            locks,
            queue: Mutex::new(jobs.into_iter().collect()),
            wait_count: std::sync::atomic::AtomicU32::new(0),
            status: RwLock::new(Vec::new()),
            terminal_tx,
            terminal_rx,
        });
        proc
    }

    /// Procedure identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Procedure name, usually the command that created it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys the procedure serializes on.
    pub fn locks(&self) -> &LockSet {
        &self.locks
    }

    /// Append a status record.
    pub(crate) async fn record(&self, state: JobState, success: bool, description: String) {
        self.status
            .write()
            .await
            .push(StatusRecord::now(state, success, description));
    }

    /// The full status history, oldest first.
    pub async fn status(&self) -> Vec<StatusRecord> {
        self.status.read().await.clone()
    }

    /// The most recent status record, if any.
    pub async fn last_status(&self) -> Option<StatusRecord> {
        self.status.read().await.last().cloned()
    }

    /// Whether the procedure has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.terminal_rx.borrow().is_some()
    }

    /// Terminal outcome: `None` while running, `Some(success)` after.
    pub fn outcome(&self) -> Option<bool> {
        *self.terminal_rx.borrow()
    }

    pub(crate) fn set_terminal(&self, success: bool) {
        // First write wins; a procedure terminates exactly once.
        self.terminal_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(success);
                true
            } else {
                false
            }
        });
    }

    /// Wait until the procedure reaches a terminal state; returns whether it
    /// succeeded.
    pub async fn wait(&self) -> bool {
        let mut rx = self.terminal_rx.clone();
        loop {
            if let Some(success) = *rx.borrow_and_update() {
                return success;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without terminating; treat as aborted.
                return false;
            }
        }
    }

    /// Wait with a bound; `Err(Timeout)` means the procedure is still
    /// running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool, Error> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout(format!("procedure ({}) is still running", self.uuid)))
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("locks", &self.locks)
            .field("terminal", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_types::lock_set;
    use serde_json::json;

    #[tokio::test]
    async fn wait_returns_after_terminal() {
        let proc = Procedure::new(
            Uuid::new_v4(),
            "test.wait",
            lock_set(["a"]),
            vec![Job::new(JobSpec::new("noop", json!([])))],
        );

        let waiter = {
            let proc = proc.clone();
            tokio::spawn(async move { proc.wait().await })
        };

        proc.set_terminal(true);
        assert!(waiter.await.unwrap());
        assert!(proc.is_terminal());
        assert_eq!(proc.outcome(), Some(true));

        // Terminal state is sticky.
        proc.set_terminal(false);
        assert_eq!(proc.outcome(), Some(true));
    }

    #[tokio::test]
    async fn wait_timeout_reports_still_running() {
        let proc = Procedure::new(Uuid::new_v4(), "test.timeout", LockSet::new(), vec![]);
        let result = proc.wait_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
