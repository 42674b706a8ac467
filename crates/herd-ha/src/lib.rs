#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-ha** – Group and server administration for the herd controller.
//!
//! The bodies of the mutating `group.*` commands, the promotion/failover
//! election logic, the liveness probe abstraction, and the handlers behind
//! the built-in `SERVER_LOST` / `FAIL_OVER` / `NEW_SERVER_ADD` events. The
//! operations here run inside procedure jobs, under the group locks the
//! executor already holds.

pub mod handlers;
pub mod ops;
pub mod probe;

pub use handlers::{register_actions, register_events};
pub use ops::{group_lock, server_lock, ServerHealth};
pub use probe::{ScriptedProbe, ServerProbe, TcpProbe, DEFAULT_PROBE_TIMEOUT};
