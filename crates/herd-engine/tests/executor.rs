//! End-to-end executor behaviour: ordering, serialization, compensation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Barrier, Mutex};
use uuid::Uuid;

use herd_engine::{ActionOutcome, ActionRegistry, Executor, ExecutorConfig, JobSpec};
use herd_lock::LockManager;
use herd_store::Store;
use herd_types::{lock_set, CheckpointPhase, Error, JobState};

async fn executor_with(actions: ActionRegistry) -> (Executor, Store) {
    let store = Store::in_memory().await.unwrap();
    let executor = Executor::new(
        store.clone(),
        LockManager::new(),
        Arc::new(actions),
        ExecutorConfig::default(),
    );
    executor.start().await;
    (executor, store)
}

#[tokio::test]
async fn basic_procedure_runs_to_completion() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let calls = calls.clone();
        actions.register("test.count", move |_args| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let (executor, store) = executor_with(actions).await;

    let proc = executor
        .enqueue_procedure(
            "test.count",
            "Enqueuing action test.count().",
            lock_set(["lock"]),
            json!([]),
        )
        .await
        .unwrap();
    assert!(proc.wait().await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The registry serves the same handle back.
    let fetched = executor.get_procedure(proc.uuid()).unwrap();
    assert_eq!(fetched.uuid(), proc.uuid());

    let status = proc.last_status().await.unwrap();
    assert_eq!(status.state, JobState::Complete);
    assert!(status.success);
    assert_eq!(status.description, "Executed action (test.count).");

    // Audit row and statistics agree with the run.
    let row = store.fetch_procedure(proc.uuid()).await.unwrap().unwrap();
    assert_eq!(row.success, Some(true));
    let stats = store.procedure_stats("test.count").await.unwrap();
    assert_eq!(stats[0].call_count, 1);
    assert_eq!(stats[0].call_abort, 0);

    executor.shutdown().await;
}

#[tokio::test]
async fn enqueue_rejects_unknown_actions() {
    let (executor, _store) = executor_with(ActionRegistry::new()).await;
    let result = executor
        .enqueue_procedure("no.such.action", "Enqueue bad action.", lock_set(["lock"]), json!([]))
        .await;
    assert!(matches!(result, Err(Error::NotCallable(_))));

    // Unknown procedures simply come back as None.
    assert!(executor.get_procedure(Uuid::new_v4()).is_none());
    executor.shutdown().await;
}

#[tokio::test]
async fn multi_dispatch_then_reap() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut actions = ActionRegistry::new();
    {
        let seen = seen.clone();
        actions.register("test.record", move |args| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(args[0].as_i64().unwrap());
                Ok(ActionOutcome::done())
            }
        });
    }
    let (executor, _store) = executor_with(actions).await;

    let mut procs = Vec::new();
    for num in (1..10).step_by(2) {
        let proc = executor
            .enqueue_procedure(
                "test.record",
                &format!("Recording ({num})."),
                lock_set(["lock"]),
                json!([num]),
            )
            .await
            .unwrap();
        procs.push(proc);
    }
    for proc in &procs {
        assert!(proc.wait().await);
    }

    let mut values = seen.lock().await.clone();
    values.sort();
    assert_eq!(values, vec![1, 3, 5, 7, 9]);
    executor.shutdown().await;
}

#[tokio::test]
async fn overlapping_procedures_never_interleave() {
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let running = running.clone();
        let max_running = max_running.clone();
        actions.register("test.busy", move |_args| {
            let running = running.clone();
            let max_running = max_running.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let (executor, _store) = executor_with(actions).await;

    let mut procs = Vec::new();
    for n in 0..6 {
        procs.push(
            executor
                .enqueue_procedure(
                    "test.busy",
                    &format!("Busy ({n})."),
                    lock_set(["group/gA"]),
                    json!([]),
                )
                .await
                .unwrap(),
        );
    }
    for proc in procs {
        assert!(proc.wait().await);
    }
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn disjoint_procedures_run_in_parallel() {
    // Both procedures block on the same barrier; they can only finish if
    // the executor really runs them concurrently.
    let barrier = Arc::new(Barrier::new(2));
    let mut actions = ActionRegistry::new();
    {
        let barrier = barrier.clone();
        actions.register("test.meet", move |_args| {
            let barrier = barrier.clone();
            async move {
                tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                    .await
                    .map_err(|_| Error::Timeout("barrier never met".into()))?;
                Ok(ActionOutcome::done())
            }
        });
    }
    let (executor, _store) = executor_with(actions).await;

    let a = executor
        .enqueue_procedure("test.meet", "Meet (gA).", lock_set(["group/gA"]), json!([]))
        .await
        .unwrap();
    let b = executor
        .enqueue_procedure("test.meet", "Meet (gB).", lock_set(["group/gB"]), json!([]))
        .await
        .unwrap();
    assert!(a.wait().await);
    assert!(b.wait().await);
    executor.shutdown().await;
}

#[tokio::test]
async fn failed_job_rolls_back_completed_work() {
    let undone = Arc::new(Mutex::new(Vec::new()));
    let mut actions = ActionRegistry::new();
    actions.register("test.step", |_args| async { Ok(ActionOutcome::done()) });
    {
        let undone = undone.clone();
        actions.register("test.unstep", move |args| {
            let undone = undone.clone();
            async move {
                undone.lock().await.push(args[0].as_str().unwrap().to_string());
                Ok(ActionOutcome::done())
            }
        });
    }
    actions.register("test.explode", |_args| async {
        Err(Error::Procedure("deliberate failure".into()))
    });
    let (executor, store) = executor_with(actions).await;

    let proc = executor
        .enqueue(
            "test.rollback",
            "Rollback scenario.",
            lock_set(["group/g1"]),
            vec![
                JobSpec::new("test.step", json!(["one"]))
                    .with_undo("test.unstep", json!(["one"])),
                JobSpec::new("test.step", json!(["two"]))
                    .with_undo("test.unstep", json!(["two"])),
                JobSpec::new("test.explode", json!([])),
                // Never reached; drained when the explosion happens.
                JobSpec::new("test.step", json!(["never"])),
            ],
        )
        .await
        .unwrap();

    assert!(!proc.wait().await);
    // Undos run in reverse completion order.
    assert_eq!(*undone.lock().await, vec!["two".to_string(), "one".to_string()]);

    // The procedure aborted and the counters say so.
    let stats = store.procedure_stats("test.rollback").await.unwrap();
    assert_eq!(stats[0].call_count, 1);
    assert_eq!(stats[0].call_abort, 1);

    // Checkpoint log: strictly monotonic, all closed out.
    let log = store.checkpoints_for(proc.uuid()).await.unwrap();
    let mut last_seq = -1;
    for row in &log {
        assert!(row.sequence > last_seq);
        last_seq = row.sequence;
    }
    assert!(log
        .iter()
        .all(|row| row.phase != CheckpointPhase::Started));
    executor.shutdown().await;
}

#[tokio::test]
async fn follow_up_jobs_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut actions = ActionRegistry::new();
    {
        let order = order.clone();
        actions.register("test.chain", move |args| {
            let order = order.clone();
            async move {
                let depth = args[0].as_i64().unwrap();
                order.lock().await.push(depth);
                if depth < 3 {
                    Ok(ActionOutcome::follow_up(vec![JobSpec::new(
                        "test.chain",
                        json!([depth + 1]),
                    )]))
                } else {
                    Ok(ActionOutcome::done())
                }
            }
        });
    }
    let (executor, store) = executor_with(actions).await;

    let proc = executor
        .enqueue_procedure("test.chain", "Chained jobs.", lock_set(["chain"]), json!([0]))
        .await
        .unwrap();
    assert!(proc.wait().await);
    assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);

    // One checkpoint per job, one statistics bump for the procedure.
    let log = store.checkpoints_for(proc.uuid()).await.unwrap();
    assert_eq!(log.len(), 4);
    let stats = store.procedure_stats("test.chain").await.unwrap();
    assert_eq!(stats[0].call_count, 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_queued_work() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let calls = calls.clone();
        actions.register("test.slow", move |_args| {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let (executor, _store) = executor_with(actions).await;

    for n in 0..5 {
        executor
            .enqueue_procedure(
                "test.slow",
                &format!("Slow ({n})."),
                lock_set(["serial"]),
                json!([]),
            )
            .await
            .unwrap();
    }
    executor.shutdown().await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // A stopped executor refuses new work.
    let result = executor
        .enqueue_procedure("test.slow", "Late.", lock_set(["serial"]), json!([]))
        .await;
    assert!(matches!(result, Err(Error::Procedure(_))));
}
