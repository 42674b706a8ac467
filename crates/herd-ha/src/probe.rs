//! Server liveness probes.
//!
//! A probe is one bounded connectivity check against a managed server. The
//! production probe opens a TCP connection to the server's address and calls
//! it a day; anything deeper (replication lag, read-only state) belongs to
//! the health command, not the liveness check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::trace;

/// Default bound on one probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One liveness check against a server address.
#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// Whether the server at `address` answered within the probe's bound.
    async fn is_alive(&self, address: &str) -> bool;
}

/// Probe that opens a TCP connection with a bounded timeout.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Create a probe with the given per-attempt bound.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ServerProbe for TcpProbe {
    async fn is_alive(&self, address: &str) -> bool {
        let alive = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        );
        trace!(address, alive, "probe");
        alive
    }
}

/// Probe answering from a table, for tests and demos.
///
/// Addresses not in the table answer with the configured default.
#[derive(Clone)]
pub struct ScriptedProbe {
    alive: Arc<RwLock<HashMap<String, bool>>>,
    default_alive: bool,
}

impl ScriptedProbe {
    /// Create a probe where unknown addresses answer `default_alive`.
    pub fn new(default_alive: bool) -> Self {
        Self {
            alive: Arc::new(RwLock::new(HashMap::new())),
            default_alive,
        }
    }

    /// Script the answer for one address.
    pub async fn set_alive(&self, address: &str, alive: bool) {
        self.alive.write().await.insert(address.to_string(), alive);
    }
}

#[async_trait]
impl ServerProbe for ScriptedProbe {
    async fn is_alive(&self, address: &str) -> bool {
        *self
            .alive
            .read()
            .await
            .get(address)
            .unwrap_or(&self.default_alive)
    }
}
