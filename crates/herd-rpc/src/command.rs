//! The command registry and the shared command plumbing.
//!
//! Commands are a static table built at program start; discovery is a
//! compile-time list, not introspection. Each entry is `group.name`, a help
//! line, and an async execute function receiving the node context and the
//! JSON argument array. Execute functions never return `Err`; every failure
//! is already folded into the [`CommandResult`]'s error string.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use herd_engine::JobSpec;
use herd_types::{lock_set, ColumnType, CommandResult, Error, LockSet, ResultSet};

use crate::context::NodeContext;

/// Boxed future returned by a command.
pub type CommandFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;

/// A command's execute function.
pub type CommandFn = Arc<dyn Fn(Arc<NodeContext>, Value) -> CommandFuture + Send + Sync>;

/// One entry in the command table.
#[derive(Clone)]
pub struct CommandSpec {
    /// Command namespace, e.g. `group`.
    pub group: &'static str,
    /// Command name within the namespace, e.g. `promote`.
    pub name: &'static str,
    /// One-line help text.
    pub help: &'static str,
    /// The execute function.
    pub execute: CommandFn,
}

impl CommandSpec {
    /// The dotted method name clients call.
    pub fn method(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

/// Static `method → command` table.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command; the registration order is the `list_commands` order.
    pub fn register<F, Fut>(
        &mut self,
        group: &'static str,
        name: &'static str,
        help: &'static str,
        execute: F,
    ) where
        F: Fn(Arc<NodeContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        let spec = CommandSpec {
            group,
            name,
            help,
            execute: Arc::new(move |ctx, args| Box::pin(execute(ctx, args))),
        };
        self.index.insert(spec.method(), self.commands.len());
        self.commands.push(spec);
    }

    /// Look a command up by its dotted method name.
    pub fn lookup(&self, method: &str) -> Option<&CommandSpec> {
        self.index.get(method).map(|&i| &self.commands[i])
    }

    /// Every registered command, in registration order.
    pub fn all(&self) -> &[CommandSpec] {
        &self.commands
    }

    /// Dispatch one request.
    pub async fn dispatch(
        &self,
        ctx: Arc<NodeContext>,
        method: &str,
        params: Value,
    ) -> CommandResult {
        match self.lookup(method) {
            Some(spec) => (spec.execute)(ctx, params).await,
            None => CommandResult::fail(Error::Procedure(format!(
                "command ({method}) was not found"
            ))),
        }
    }
}

//─────────────────────────────
//  Shared command plumbing
//─────────────────────────────

/// Pop the reserved trailing `synchronous` flag off an argument array.
///
/// Every command reserves its last argument for this; a missing flag means
/// `default`.
pub fn split_synchronous(params: Value, default: bool) -> (Value, bool) {
    match params {
        Value::Array(mut items) => {
            let synchronous = match items.last() {
                Some(Value::Bool(flag)) => {
                    let flag = *flag;
                    items.pop();
                    flag
                }
                _ => default,
            };
            (Value::Array(items), synchronous)
        }
        Value::Null => (json!([]), default),
        other => (other, default),
    }
}

/// A one-row result set carrying a procedure uuid.
pub fn procedure_result(uuid: uuid::Uuid) -> ResultSet {
    let mut set = ResultSet::new(vec!["uuid"], vec![ColumnType::Str]);
    set.rows.push(vec![json!(uuid.to_string())]);
    set
}

/// Enqueue a procedure for a mutating command and encode the outcome.
///
/// Asynchronous calls return the procedure uuid immediately; synchronous
/// calls wait for the terminal state and fail with the last status record's
/// description when the procedure aborted.
pub async fn run_procedure_command(
    ctx: &NodeContext,
    name: &str,
    locks: LockSet,
    jobs: Vec<JobSpec>,
    synchronous: bool,
) -> CommandResult {
    let proc = match ctx
        .executor
        .enqueue(name, &format!("Executing ({name})."), locks, jobs)
        .await
    {
        Ok(proc) => proc,
        Err(err) => return CommandResult::fail(err),
    };
    if !synchronous {
        return CommandResult::ok(vec![procedure_result(proc.uuid())]);
    }
    let success = proc.wait().await;
    if success {
        CommandResult::ok(vec![procedure_result(proc.uuid())])
    } else {
        let reason = proc
            .last_status()
            .await
            .map(|status| status.description)
            .unwrap_or_else(|| format!("procedure ({name}) aborted"));
        CommandResult::fail(Error::Procedure(reason))
    }
}

/// Lock set protecting one group.
pub fn group_locks(group_id: &str) -> LockSet {
    lock_set([herd_ha::group_lock(group_id)])
}
