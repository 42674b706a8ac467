//! Crash-recovery behaviour: replaying the checkpoint log at startup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use herd_engine::{recover, ActionOutcome, ActionRegistry, Executor, ExecutorConfig};
use herd_lock::LockManager;
use herd_store::{JobCheckpoint, Store};
use herd_types::{lock_set, Error};

/// Fake a controller crash: a procedure with a `STARTED` checkpoint and no
/// `FINISHED` row, exactly what an unclean shutdown leaves behind.
async fn plant_interrupted(
    store: &Store,
    name: &str,
    do_action: &str,
    undo_action: Option<&str>,
) -> (Uuid, Uuid) {
    let proc_uuid = Uuid::new_v4();
    let job_uuid = Uuid::new_v4();
    store
        .insert_procedure(proc_uuid, name, &lock_set(["group/g1"]))
        .await
        .unwrap();
    let job = JobCheckpoint {
        job_uuid,
        do_action: do_action.to_string(),
        undo_action: undo_action.map(str::to_string),
        args: json!(["g1"]),
    };
    let mut tx = store.begin().await.unwrap();
    Store::checkpoint_start_tx(&mut tx, proc_uuid, &job).await.unwrap();
    tx.commit().await.unwrap();
    (proc_uuid, job_uuid)
}

async fn booted(actions: ActionRegistry, store: Store) -> Executor {
    let executor = Executor::new(
        store,
        LockManager::new(),
        Arc::new(actions),
        ExecutorConfig::default(),
    );
    executor.start().await;
    executor
}

#[tokio::test]
async fn interrupted_job_with_undo_is_compensated_and_aborted() {
    let store = Store::in_memory().await.unwrap();
    let (proc_uuid, _) =
        plant_interrupted(&store, "test.crashed", "test.do", Some("test.undo")).await;

    let undos = Arc::new(AtomicUsize::new(0));
    let dos = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let dos = dos.clone();
        actions.register("test.do", move |_args| {
            let dos = dos.clone();
            async move {
                dos.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let undos = undos.clone();
        actions.register("test.undo", move |_args| {
            let undos = undos.clone();
            async move {
                undos.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let executor = booted(actions, store.clone()).await;

    assert!(!recover(&executor, &store).await, "recovery should succeed");

    // The undo ran, the original do action did not run again.
    assert_eq!(undos.load(Ordering::SeqCst), 1);
    assert_eq!(dos.load(Ordering::SeqCst), 0);

    // The interrupted procedure is permanently aborted and counted.
    let row = store.fetch_procedure(proc_uuid).await.unwrap().unwrap();
    assert_eq!(row.success, Some(false));
    let stats = store.procedure_stats("test.crashed").await.unwrap();
    assert_eq!(stats[0].call_abort, 1);

    // Nothing is left to recover.
    assert!(store.unfinished().await.unwrap().is_empty());
    executor.shutdown().await;
}

#[tokio::test]
async fn interrupted_job_without_undo_is_rerun() {
    let store = Store::in_memory().await.unwrap();
    let (proc_uuid, _) = plant_interrupted(&store, "test.rerun", "test.do", None).await;

    let dos = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let dos = dos.clone();
        actions.register("test.do", move |_args| {
            let dos = dos.clone();
            async move {
                dos.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let executor = booted(actions, store.clone()).await;

    assert!(!recover(&executor, &store).await);
    assert_eq!(dos.load(Ordering::SeqCst), 1);

    // Re-run happens under the original identity and finishes cleanly.
    let row = store.fetch_procedure(proc_uuid).await.unwrap().unwrap();
    assert_eq!(row.success, Some(true));
    assert!(store.unfinished().await.unwrap().is_empty());
    executor.shutdown().await;
}

#[tokio::test]
async fn scheduled_only_procedures_are_reenqueued_in_order() {
    let store = Store::in_memory().await.unwrap();
    let proc_uuid = Uuid::new_v4();
    store
        .insert_procedure(proc_uuid, "test.pending", &lock_set(["group/g2"]))
        .await
        .unwrap();
    let jobs: Vec<JobCheckpoint> = ["first", "second", "third"]
        .iter()
        .map(|tag| JobCheckpoint {
            job_uuid: Uuid::new_v4(),
            do_action: "test.tagged".to_string(),
            undo_action: None,
            args: json!([tag]),
        })
        .collect();
    store.checkpoint_schedule(proc_uuid, &jobs).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut actions = ActionRegistry::new();
    {
        let order = order.clone();
        actions.register("test.tagged", move |args| {
            let order = order.clone();
            async move {
                order.lock().await.push(args[0].as_str().unwrap().to_string());
                Ok(ActionOutcome::done())
            }
        });
    }
    let executor = booted(actions, store.clone()).await;

    assert!(!recover(&executor, &store).await);
    let proc = executor.get_procedure(proc_uuid).unwrap();
    assert!(proc.wait().await);
    assert_eq!(
        *order.lock().await,
        vec!["first".to_string(), "second".to_string(), "third".to_string()]
    );
    executor.shutdown().await;
}

#[tokio::test]
async fn committed_follow_up_is_resumed_after_a_crash() {
    // Crash window: a job's FINISHED row and its follow-up's SCHEDULED row
    // committed together, then the process died before the follow-up ran.
    let store = Store::in_memory().await.unwrap();
    let proc_uuid = Uuid::new_v4();
    store
        .insert_procedure(proc_uuid, "test.followup", &lock_set(["group/g1"]))
        .await
        .unwrap();
    let done = JobCheckpoint {
        job_uuid: Uuid::new_v4(),
        do_action: "test.done".to_string(),
        undo_action: None,
        args: json!(["g1"]),
    };
    let follow_up = JobCheckpoint {
        job_uuid: Uuid::new_v4(),
        do_action: "test.follow".to_string(),
        undo_action: None,
        args: json!(["g1"]),
    };
    store.checkpoint_schedule(proc_uuid, &[done.clone()]).await.unwrap();
    let mut tx = store.begin().await.unwrap();
    Store::checkpoint_start_tx(&mut tx, proc_uuid, &done).await.unwrap();
    Store::checkpoint_finish_tx(&mut tx, proc_uuid, done.job_uuid, true)
        .await
        .unwrap();
    Store::checkpoint_schedule_tx(&mut tx, proc_uuid, &[follow_up.clone()])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let dones = Arc::new(AtomicUsize::new(0));
    let follows = Arc::new(AtomicUsize::new(0));
    let mut actions = ActionRegistry::new();
    {
        let dones = dones.clone();
        actions.register("test.done", move |_args| {
            let dones = dones.clone();
            async move {
                dones.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let follows = follows.clone();
        actions.register("test.follow", move |_args| {
            let follows = follows.clone();
            async move {
                follows.fetch_add(1, Ordering::SeqCst);
                Ok(ActionOutcome::done())
            }
        });
    }
    let executor = booted(actions, store.clone()).await;

    assert!(!recover(&executor, &store).await);
    let proc = executor.get_procedure(proc_uuid).unwrap();
    assert!(proc.wait().await);

    // Only the pending follow-up ran; the finished job stayed finished.
    assert_eq!(follows.load(Ordering::SeqCst), 1);
    assert_eq!(dones.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.fetch_procedure(proc_uuid).await.unwrap().unwrap().success,
        Some(true)
    );
    assert!(store.unfinished().await.unwrap().is_empty());
    assert!(store.scheduled().await.unwrap().is_empty());
    executor.shutdown().await;
}

#[tokio::test]
async fn interrupted_procedure_resumes_its_pending_jobs() {
    // Crash window: job A was STARTED and job B of the same procedure was
    // still SCHEDULED. The replay re-runs A, then B, like a crash-free run.
    let store = Store::in_memory().await.unwrap();
    let proc_uuid = Uuid::new_v4();
    store
        .insert_procedure(proc_uuid, "test.resume", &lock_set(["group/g1"]))
        .await
        .unwrap();
    let jobs: Vec<JobCheckpoint> = ["a", "b"]
        .iter()
        .map(|tag| JobCheckpoint {
            job_uuid: Uuid::new_v4(),
            do_action: "test.tagged".to_string(),
            undo_action: None,
            args: json!([tag]),
        })
        .collect();
    store.checkpoint_schedule(proc_uuid, &jobs).await.unwrap();
    let mut tx = store.begin().await.unwrap();
    Store::checkpoint_start_tx(&mut tx, proc_uuid, &jobs[0]).await.unwrap();
    tx.commit().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut actions = ActionRegistry::new();
    {
        let order = order.clone();
        actions.register("test.tagged", move |args| {
            let order = order.clone();
            async move {
                order.lock().await.push(args[0].as_str().unwrap().to_string());
                Ok(ActionOutcome::done())
            }
        });
    }
    let executor = booted(actions, store.clone()).await;

    assert!(!recover(&executor, &store).await);
    assert_eq!(*order.lock().await, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(
        store.fetch_procedure(proc_uuid).await.unwrap().unwrap().success,
        Some(true)
    );
    assert!(store.unfinished().await.unwrap().is_empty());
    assert!(store.scheduled().await.unwrap().is_empty());
    executor.shutdown().await;
}

#[tokio::test]
async fn failing_undo_is_reported_but_recovery_continues() {
    let store = Store::in_memory().await.unwrap();
    let (first, _) =
        plant_interrupted(&store, "test.bad", "test.do", Some("test.badundo")).await;
    let (second, _) = plant_interrupted(&store, "test.good", "test.do", None).await;

    let mut actions = ActionRegistry::new();
    actions.register("test.do", |_args| async { Ok(ActionOutcome::done()) });
    actions.register("test.badundo", |_args| async {
        Err(Error::Procedure("undo cannot run".into()))
    });
    let executor = booted(actions, store.clone()).await;

    // One step failed, so recovery reports failure...
    assert!(recover(&executor, &store).await);

    // ...but both procedures were still closed out.
    assert_eq!(
        store.fetch_procedure(first).await.unwrap().unwrap().success,
        Some(false)
    );
    assert_eq!(
        store.fetch_procedure(second).await.unwrap().unwrap().success,
        Some(true)
    );
    assert!(store.unfinished().await.unwrap().is_empty());
    executor.shutdown().await;
}
