//! The `event.*` namespace.

use serde_json::{json, Value};
use uuid::Uuid;

use herd_ha::ops::arg_str;
use herd_types::{ColumnType, CommandResult, Error, LockSet, ResultSet};

use crate::command::{split_synchronous, CommandRegistry};

pub(crate) fn register(registry: &mut CommandRegistry) {
    registry.register(
        "event",
        "trigger",
        "Trigger an event: event.trigger(event_name, args...). Returns the \
         procedure uuids it created.",
        |ctx, params| async move {
            // Triggering returns the uuids immediately; pass `true` as the
            // trailing argument to wait for the handlers instead.
            let (args, synchronous) = split_synchronous(params, false);
            let event = match arg_str(&args, 0, "event_name") {
                Ok(event) => event,
                Err(err) => return CommandResult::fail(err),
            };
            let rest = match &args {
                Value::Array(items) => Value::Array(items[1..].to_vec()),
                _ => json!([]),
            };
            let procs = match ctx
                .events
                .trigger(&ctx.executor, &event, LockSet::new(), rest)
                .await
            {
                Ok(procs) => procs,
                Err(err) => return CommandResult::fail(err),
            };
            if synchronous {
                if let Err(err) = ctx.executor.wait_for_procedures(&procs).await {
                    return CommandResult::fail(err);
                }
            }
            let mut set = ResultSet::new(vec!["uuid"], vec![ColumnType::Str]);
            for uuid in procs {
                set.rows.push(vec![json!(uuid.to_string())]);
            }
            CommandResult::ok(vec![set])
        },
    );

    registry.register(
        "event",
        "wait_for_procedures",
        "Wait until the given procedures finish: \
         event.wait_for_procedures(\"uuid[,uuid...]\").",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let raw = match arg_str(&args, 0, "proc_uuids") {
                Ok(raw) => raw,
                Err(err) => return CommandResult::fail(err),
            };
            let mut uuids = Vec::new();
            for part in raw.split(',') {
                match Uuid::parse_str(part.trim()) {
                    Ok(uuid) => uuids.push(uuid),
                    Err(_) => {
                        return CommandResult::fail(Error::Procedure(format!(
                            "bad procedure uuid ({})",
                            part.trim()
                        )))
                    }
                }
            }
            match ctx.executor.wait_for_procedures(&uuids).await {
                Ok(all_ok) => {
                    let mut set = ResultSet::new(vec!["finished"], vec![ColumnType::Bool]);
                    set.rows.push(vec![json!(all_ok)]);
                    CommandResult::ok(vec![set])
                }
                Err(err) => CommandResult::fail(err),
            }
        },
    );
}
