//! Error kinds shared across the workspace.
//!
//! One enum, one variant per failure family. Domain validation failures
//! (`Server`, `Group`, `Sharding`) travel back to the RPC caller as the
//! response's error string; `Lock` never escapes the lock manager and is an
//! internal assertion when it does.

use serde::{Deserialize, Serialize};

/// Failure families recognized across the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Irrecoverable configuration problem; aborts startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failure that survived the retry policy.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal lock manager assertion.
    #[error("lock error: {0}")]
    Lock(String),

    /// User-visible failure of a procedure.
    #[error("procedure error: {0}")]
    Procedure(String),

    /// Domain validation failure on a server.
    #[error("server error: {0}")]
    Server(String),

    /// Domain validation failure on a group.
    #[error("group error: {0}")]
    Group(String),

    /// Domain validation failure on shard metadata.
    #[error("sharding error: {0}")]
    Sharding(String),

    /// A probe or wait exceeded its bound.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An action name could not be resolved to callable code.
    #[error("action is not callable: {0}")]
    NotCallable(String),
}

impl Error {
    /// Whether the error should abort the whole process rather than a single
    /// command or procedure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
