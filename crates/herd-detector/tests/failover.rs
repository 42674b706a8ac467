//! End-to-end failover: a lost primary is detected, reported once, and a
//! secondary takes over.

use std::sync::Arc;
use std::time::Duration;

use herd_detector::{DetectorConfig, FailureDetector};
use herd_engine::{ActionRegistry, Executor, ExecutorConfig};
use herd_events::EventRegistry;
use herd_ha::{ops, ScriptedProbe};
use herd_lock::LockManager;
use herd_store::Store;
use herd_types::{GroupStatus, ServerStatus};

struct Rig {
    store: Store,
    probe: ScriptedProbe,
    executor: Executor,
    detector: FailureDetector,
}

async fn rig() -> Rig {
    let store = Store::in_memory().await.unwrap();
    let probe = ScriptedProbe::new(true);

    let mut actions = ActionRegistry::new();
    herd_ha::register_actions(&mut actions, store.clone(), Arc::new(probe.clone()));
    let executor = Executor::new(
        store.clone(),
        LockManager::new(),
        Arc::new(actions),
        ExecutorConfig::default(),
    );
    executor.start().await;

    let mut events = EventRegistry::new();
    herd_ha::register_events(&mut events);

    let detector = FailureDetector::new(
        store.clone(),
        executor.clone(),
        Arc::new(events),
        Arc::new(probe.clone()),
        DetectorConfig {
            period: Duration::from_millis(20),
            ..DetectorConfig::default()
        },
    );

    Rig {
        store,
        probe,
        executor,
        detector,
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn lost_primary_is_replaced_by_a_secondary() {
    let rig = rig().await;

    // g1 with a primary and one in-sync secondary.
    ops::create_group(&rig.store, "g1", None).await.unwrap();
    let a = ops::add_server(&rig.store, "g1", "db-a:3306").await.unwrap();
    ops::configure_server(&rig.store, "g1", a).await.unwrap();
    let b = ops::add_server(&rig.store, "g1", "db-b:3306").await.unwrap();
    ops::configure_server(&rig.store, "g1", b).await.unwrap();
    ops::promote(&rig.store, &rig.probe, "g1").await.unwrap();
    let master = rig
        .store
        .fetch_group("g1")
        .await
        .unwrap()
        .unwrap()
        .master_uuid
        .unwrap();
    let master_address = rig
        .store
        .fetch_server(master)
        .await
        .unwrap()
        .unwrap()
        .address;
    ops::activate_group(&rig.store, &rig.probe, "g1").await.unwrap();

    rig.detector.register_groups().await;
    assert_eq!(rig.detector.monitored(), vec!["g1".to_string()]);

    // Kill the primary's process.
    rig.probe.set_alive(&master_address, false).await;

    let survivor = if master == a { b } else { a };
    let store = rig.store.clone();
    wait_until("secondary takes over as primary", || {
        let store = store.clone();
        async move {
            store.fetch_group("g1").await.unwrap().unwrap().master_uuid == Some(survivor)
        }
    })
    .await;

    // Old primary is faulty, survivor is the one and only primary.
    assert_eq!(
        rig.store.fetch_server(master).await.unwrap().unwrap().status,
        ServerStatus::Faulty
    );
    let primaries: Vec<_> = rig
        .store
        .servers_in_group("g1")
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.status == ServerStatus::Primary)
        .collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].uuid, survivor);

    // The loss was reported exactly once.
    let lost_stats = rig.store.procedure_stats("ha.server_lost").await.unwrap();
    assert_eq!(lost_stats[0].call_count, 1);

    // Initial promote plus the failover: two promotions on record.
    let group_stats = rig.store.group_stats("g1").await.unwrap();
    assert_eq!(group_stats[0].call_count, 2);

    rig.detector.shutdown();
    rig.executor.shutdown().await;
}

#[tokio::test]
async fn deactivated_groups_are_not_monitored() {
    let rig = rig().await;
    ops::create_group(&rig.store, "g2", None).await.unwrap();
    ops::activate_group(&rig.store, &rig.probe, "g2").await.unwrap();

    rig.detector.register_groups().await;
    assert_eq!(rig.detector.monitored(), vec!["g2".to_string()]);

    ops::deactivate_group(&rig.store, "g2").await.unwrap();
    rig.detector.reconcile().await;
    assert!(rig.detector.monitored().is_empty());

    // Reconcile picks groups back up when they reactivate.
    rig.store
        .set_group_status("g2", GroupStatus::Active)
        .await
        .unwrap();
    rig.detector.reconcile().await;
    assert_eq!(rig.detector.monitored(), vec!["g2".to_string()]);

    rig.detector.shutdown();
    rig.executor.shutdown().await;
}
