#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-rpc** – JSON-RPC facade for the herd controller.
//!
//! Dispatch-only: a request names a `group_name.command_name` method and
//! carries a JSON argument array; the matching command translates the
//! arguments into procedures on the executor (mutating commands) or plain
//! store reads (lookups and statistics), and encodes the outcome as tabular
//! result sets. The last argument of every command is the reserved
//! `synchronous` flag; when false, the response carries procedure uuids and
//! returns immediately.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod command;
pub mod commands;
pub mod context;
pub mod server;

pub use command::{CommandRegistry, CommandSpec};
pub use context::NodeContext;
pub use server::{router, serve};

use herd_types::{CommandResult, ResultSet};

//─────────────────────────────
//  Wire format
//─────────────────────────────

/// One inbound RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// `group_name.command_name`.
    pub method: String,
    /// JSON argument array; missing means no arguments.
    #[serde(default)]
    pub params: Value,
}

/// The envelope every response travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Identity of the answering controller node.
    pub node_uuid: Uuid,
    /// Fleet-state version token for client-side cache invalidation.
    pub version_token: u64,
    /// Seconds the response may be cached.
    pub ttl: u64,
    /// Tabular results; empty on failure.
    pub results: Vec<ResultSet>,
    /// Error string; `None` on success.
    pub error: Option<String>,
}

impl RpcResponse {
    /// Wrap a command outcome into the response envelope.
    pub fn from_result(
        node_uuid: Uuid,
        version_token: u64,
        ttl: u64,
        result: CommandResult,
    ) -> Self {
        Self {
            node_uuid,
            version_token,
            ttl,
            results: result.results,
            error: result.error,
        }
    }
}
