//! Static action registry.
//!
//! Every job names its action; the name is what gets checkpointed, so after
//! a crash the same name must resolve to the same code. The registry is
//! therefore populated once, at program start, from an explicit list - there
//! is no runtime discovery. A name that does not resolve fails its procedure
//! with [`Error::NotCallable`] and nothing else.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use herd_types::Error;

use crate::procedure::JobSpec;

/// What an action hands back to the executor on success.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// Jobs to append to the owning procedure, in order. They inherit the
    /// procedure's lock set.
    pub follow_ups: Vec<JobSpec>,
}

impl ActionOutcome {
    /// An outcome with nothing to append.
    pub fn done() -> Self {
        Self::default()
    }

    /// An outcome appending the given follow-up jobs.
    pub fn follow_up(jobs: Vec<JobSpec>) -> Self {
        Self { follow_ups: jobs }
    }
}

/// Boxed future returned by an action.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<ActionOutcome, Error>> + Send>>;

/// A registered action: a name bound to callable code.
pub type ActionFn = Arc<dyn Fn(Value) -> ActionFuture + Send + Sync>;

/// Name → action table, frozen after startup registration.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionFn>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to an async function taking the job's JSON arguments.
    ///
    /// Later registrations under the same name replace earlier ones, which
    /// keeps test fixtures simple; production registration happens once.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionOutcome, Error>> + Send + 'static,
    {
        self.actions
            .insert(name.into(), Arc::new(move |args| Box::pin(action(args))));
    }

    /// Resolve a name to its action.
    pub fn resolve(&self, name: &str) -> Result<ActionFn, Error> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotCallable(name.to_string()))
    }

    /// Whether a name is registered, used to reject bad enqueues early.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_resolve() {
        let mut registry = ActionRegistry::new();
        registry.register("noop", |_args| async { Ok(ActionOutcome::done()) });

        let action = registry.resolve("noop").unwrap();
        let outcome = action(json!([])).await.unwrap();
        assert!(outcome.follow_ups.is_empty());

        assert!(matches!(
            registry.resolve("missing"),
            Err(Error::NotCallable(_))
        ));
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }
}
