#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-events** – Static event registry for the herd controller.
//!
//! An event is a name bound, at program start, to an ordered list of handler
//! actions. Triggering an event enqueues one procedure per handler, in
//! registration order, and returns the new procedure uuids. Events carry no
//! persistent state of their own; the procedures they create are the durable
//! artifact. The failure detector feeds its synthetic events through the
//! same path as external commands, so everything serializes through the lock
//! manager.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use herd_engine::Executor;
use herd_types::{Error, LockSet};

//─────────────────────────────
//  Built-in event names
//─────────────────────────────

/// A monitored server stopped answering probes.
pub const SERVER_LOST: &str = "SERVER_LOST";

/// A group's primary stopped answering probes; a new one must be elected.
pub const FAIL_OVER: &str = "FAIL_OVER";

/// A server was added to a group and needs to be configured in.
pub const NEW_SERVER_ADD: &str = "NEW_SERVER_ADD";

//─────────────────────────────
//  Registry
//─────────────────────────────

/// How a handler derives the keys its procedure serializes on.
pub enum LockResolver {
    /// A fixed set, known at registration time.
    Static(LockSet),
    /// A function of the event arguments.
    Dynamic(Arc<dyn Fn(&Value) -> LockSet + Send + Sync>),
}

impl LockResolver {
    /// Resolve against the arguments of one trigger call.
    fn resolve(&self, args: &Value) -> LockSet {
        match self {
            LockResolver::Static(set) => set.clone(),
            LockResolver::Dynamic(f) => f(args),
        }
    }
}

struct HandlerDef {
    action: String,
    locks: LockResolver,
}

/// Event name → ordered handler list, populated once at program start.
#[derive(Default)]
pub struct EventRegistry {
    events: HashMap<String, Vec<HandlerDef>>,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `action` to the handler list of `event`.
    ///
    /// Handlers run as separate procedures, in the order they were
    /// registered here.
    pub fn register(
        &mut self,
        event: impl Into<String>,
        action: impl Into<String>,
        locks: LockResolver,
    ) {
        self.events.entry(event.into()).or_default().push(HandlerDef {
            action: action.into(),
            locks,
        });
    }

    /// Whether an event has at least one handler.
    pub fn contains(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }

    /// Registered event names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.events.keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueue one procedure per handler of `event` and return their uuids,
    /// in registration order.
    ///
    /// `locks` is merged into whatever each handler's resolver derives from
    /// the arguments, so a caller can always widen the serialization scope.
    pub async fn trigger(
        &self,
        executor: &Executor,
        event: &str,
        locks: LockSet,
        args: Value,
    ) -> Result<Vec<Uuid>, Error> {
        let handlers = self
            .events
            .get(event)
            .ok_or_else(|| Error::Procedure(format!("event ({event}) is not registered")))?;

        let mut procedures = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let mut handler_locks = handler.locks.resolve(&args);
            handler_locks.extend(locks.iter().cloned());
            let proc = executor
                .enqueue_procedure(
                    &handler.action,
                    &format!("Triggered by event ({event})."),
                    handler_locks,
                    args.clone(),
                )
                .await?;
            procedures.push(proc.uuid());
        }
        debug!(event, handlers = procedures.len(), "event triggered");
        Ok(procedures)
    }
}
