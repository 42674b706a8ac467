#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-detector** – Per-group failure detector for the herd controller.
//!
//! One task per active group probes every probeable member each period.
//! A member walks a small state machine: `UP` while probes succeed, `SUSPECT`
//! after its first failures, `DOWN` once the configured failure count is
//! reached. Reaching `DOWN` emits exactly one `SERVER_LOST` event - plus a
//! `FAIL_OVER` event when the lost member is the group's primary - through
//! the same event path external commands use, so the reactions serialize
//! behind concurrent admin work. The detector itself never dies: every error
//! is logged and the next tick carries on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use herd_engine::Executor;
use herd_events::{EventRegistry, FAIL_OVER, SERVER_LOST};
use herd_ha::ServerProbe;
use herd_store::Store;
use herd_types::{Error, GroupStatus, LockSet, ServerStatus};

mod tracker;
pub use tracker::{ProbeTracker, Transition};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Failure detector tuning knobs.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Time between probe rounds for each group.
    pub period: Duration,
    /// Consecutive failures before a member is suspected.
    pub failures_to_suspect: u32,
    /// Consecutive failures before a member is declared down.
    pub failures_to_down: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            failures_to_suspect: 1,
            failures_to_down: 2,
        }
    }
}

//─────────────────────────────
//  Detector registry
//─────────────────────────────

struct Inner {
    store: Store,
    executor: Executor,
    events: Arc<EventRegistry>,
    probe: Arc<dyn ServerProbe>,
    config: DetectorConfig,
    groups: DashMap<String, CancellationToken>,
    cancel: CancellationToken,
}

/// Registry of per-group probe tasks.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct FailureDetector {
    inner: Arc<Inner>,
}

impl FailureDetector {
    /// Create a detector registry; nothing is monitored until groups are
    /// registered.
    pub fn new(
        store: Store,
        executor: Executor,
        events: Arc<EventRegistry>,
        probe: Arc<dyn ServerProbe>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                events,
                probe,
                config,
                groups: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start a probe task for one group. Registering twice is a no-op.
    pub fn register_group(&self, group_id: &str) {
        if self.inner.groups.contains_key(group_id) || self.inner.cancel.is_cancelled() {
            return;
        }
        let token = self.inner.cancel.child_token();
        self.inner
            .groups
            .insert(group_id.to_string(), token.clone());
        let inner = self.inner.clone();
        let group_id = group_id.to_string();
        info!(group_id, "monitoring group");
        tokio::spawn(async move {
            probe_loop(inner, group_id, token).await;
        });
    }

    /// Stop the probe task for one group.
    pub fn unregister_group(&self, group_id: &str) {
        if let Some((_, token)) = self.inner.groups.remove(group_id) {
            info!(group_id, "stopped monitoring group");
            token.cancel();
        }
    }

    /// Startup sweep: register every active group.
    pub async fn register_groups(&self) {
        info!("starting failure detector");
        match self.inner.store.groups_by_status(GroupStatus::Active).await {
            Ok(groups) => {
                for group in groups {
                    self.register_group(&group.group_id);
                }
            }
            Err(err) => error!(error = %err, "cannot list active groups"),
        }
    }

    /// Align the running probe tasks with the set of active groups.
    ///
    /// Called periodically by the supervisor, so `group.activate` and
    /// `group.deactivate` take effect without cross-layer plumbing.
    pub async fn reconcile(&self) {
        let active = match self.inner.store.groups_by_status(GroupStatus::Active).await {
            Ok(groups) => groups,
            Err(err) => {
                error!(error = %err, "cannot list active groups");
                return;
            }
        };
        let wanted: Vec<String> = active.into_iter().map(|g| g.group_id).collect();
        for group_id in &wanted {
            self.register_group(group_id);
        }
        let stale: Vec<String> = self
            .inner
            .groups
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !wanted.contains(id))
            .collect();
        for group_id in stale {
            self.unregister_group(&group_id);
        }
    }

    /// Spawn the supervisor task that keeps the registry reconciled.
    pub fn start_supervisor(&self) {
        let detector = self.clone();
        let period = self.inner.config.period;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = detector.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => detector.reconcile().await,
                }
            }
            debug!("detector supervisor stopped");
        });
    }

    /// Groups currently being monitored, sorted.
    pub fn monitored(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .inner
            .groups
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        groups.sort();
        groups
    }

    /// Stop every probe task and the supervisor.
    pub fn shutdown(&self) {
        info!("stopping failure detector");
        self.inner.cancel.cancel();
        self.inner.groups.clear();
    }
}

//─────────────────────────────
//  Probe loop
//─────────────────────────────

async fn probe_loop(inner: Arc<Inner>, group_id: String, token: CancellationToken) {
    let mut trackers: HashMap<Uuid, ProbeTracker> = HashMap::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.config.period) => {}
        }
        if let Err(err) = probe_round(&inner, &group_id, &mut trackers).await {
            // The detector never dies; log and try again next period.
            error!(group_id, error = %err, "probe round failed");
        }
    }
    debug!(group_id, "probe loop stopped");
}

async fn probe_round(
    inner: &Inner,
    group_id: &str,
    trackers: &mut HashMap<Uuid, ProbeTracker>,
) -> Result<(), Error> {
    let Some(group) = inner.store.fetch_group(group_id).await? else {
        return Ok(());
    };
    if group.status != GroupStatus::Active {
        return Ok(());
    }

    let servers = inner.store.servers_in_group(group_id).await?;
    trackers.retain(|uuid, _| servers.iter().any(|s| s.uuid == *uuid));

    for server in servers {
        if !matches!(
            server.status,
            ServerStatus::Primary | ServerStatus::Secondary | ServerStatus::Spare
        ) {
            trackers.remove(&server.uuid);
            continue;
        }
        let alive = inner.probe.is_alive(&server.address).await;
        let tracker = trackers
            .entry(server.uuid)
            .or_insert_with(|| ProbeTracker::new(&inner.config));
        match tracker.observe(alive) {
            Transition::None => {}
            Transition::Suspected => {
                warn!(group_id, server = %server.uuid, "server suspected");
            }
            Transition::Recovered => {
                debug!(group_id, server = %server.uuid, "server recovered");
            }
            Transition::Down => {
                warn!(group_id, server = %server.uuid, "server down");
                let is_master = group.master_uuid == Some(server.uuid);
                if let Err(err) = inner
                    .events
                    .trigger(
                        &inner.executor,
                        SERVER_LOST,
                        LockSet::new(),
                        json!([group_id, server.uuid.to_string()]),
                    )
                    .await
                {
                    error!(group_id, error = %err, "cannot trigger server-lost event");
                }
                if is_master {
                    if let Err(err) = inner
                        .store
                        .set_server_status(server.uuid, ServerStatus::Faulty)
                        .await
                    {
                        error!(group_id, error = %err, "cannot mark lost primary faulty");
                    }
                    if let Err(err) = inner
                        .events
                        .trigger(
                            &inner.executor,
                            FAIL_OVER,
                            LockSet::new(),
                            json!([group_id]),
                        )
                        .await
                    {
                        error!(group_id, error = %err, "cannot trigger fail-over event");
                    }
                }
            }
        }
    }
    Ok(())
}
