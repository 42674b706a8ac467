//! Per-process runtime context.
//!
//! One context per process, by convention rather than enforcement: it is
//! built once at startup and handed to every command through the dispatch
//! path. Commands reach everything through it - the store, the executor,
//! the event registry, the detector, and the logging reload hook.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herd_detector::FailureDetector;
use herd_engine::Executor;
use herd_events::EventRegistry;
use herd_ha::ServerProbe;
use herd_store::Store;
use herd_types::Error;

/// Hook for changing the process log level at runtime.
pub type LogLevelHook = Arc<dyn Fn(&str) -> Result<(), Error> + Send + Sync>;

/// Everything a command needs to execute.
pub struct NodeContext {
    /// Identity of this controller node, fresh per process.
    pub node_uuid: Uuid,
    /// When the node came up.
    pub started_at: DateTime<Utc>,
    /// Seconds clients may cache responses.
    pub ttl: u64,
    /// The persistence store.
    pub store: Store,
    /// The procedure executor.
    pub executor: Executor,
    /// The static event registry.
    pub events: Arc<EventRegistry>,
    /// The failure detector registry.
    pub detector: FailureDetector,
    /// Probe used by read-side health checks.
    pub probe: Arc<dyn ServerProbe>,
    /// Changes the process log filter; wired up by the daemon.
    pub log_level: LogLevelHook,
    /// Fired by `manage.stop`; the daemon shuts down on it.
    pub shutdown: CancellationToken,
}

impl NodeContext {
    /// Seconds since the node came up.
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
