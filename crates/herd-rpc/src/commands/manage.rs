//! The `manage.*` namespace.
//!
//! Node management over the wire. `manage.start` is deliberately absent:
//! starting the daemon is the local CLI's job, everything after that is
//! remote.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;

use herd_ha::ops::{arg_opt_str, arg_str};
use herd_types::{ColumnType, CommandResult, Error, ResultSet};

use crate::command::{split_synchronous, CommandRegistry};

pub(crate) fn register(
    registry: &mut CommandRegistry,
    slot: Arc<OnceCell<Arc<CommandRegistry>>>,
) {
    registry.register(
        "manage",
        "ping",
        "Check that the node answers: manage.ping().",
        |ctx, _params| async move {
            let mut set = ResultSet::new(
                vec!["status", "uptime"],
                vec![ColumnType::Str, ColumnType::Int],
            );
            set.rows.push(vec![json!("running"), json!(ctx.uptime_secs())]);
            CommandResult::ok(vec![set])
        },
    );

    registry.register(
        "manage",
        "stop",
        "Shut the node down gracefully: manage.stop().",
        |ctx, _params| async move {
            ctx.shutdown.cancel();
            let mut set = ResultSet::new(vec!["status"], vec![ColumnType::Str]);
            set.rows.push(vec![json!("stopping")]);
            CommandResult::ok(vec![set])
        },
    );

    registry.register(
        "manage",
        "logging_level",
        "Change the log level at runtime: manage.logging_level(level).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let level = match arg_str(&args, 0, "level") {
                Ok(level) => level,
                Err(err) => return CommandResult::fail(err),
            };
            match (ctx.log_level)(&level) {
                Ok(()) => {
                    let mut set = ResultSet::new(vec!["level"], vec![ColumnType::Str]);
                    set.rows.push(vec![json!(level)]);
                    CommandResult::ok(vec![set])
                }
                Err(err) => CommandResult::fail(err),
            }
        },
    );

    {
        let slot = slot.clone();
        registry.register(
            "manage",
            "list_commands",
            "List every command the node serves: manage.list_commands().",
            move |_ctx, _params| {
                let slot = slot.clone();
                async move {
                    let Some(registry) = slot.get() else {
                        return CommandResult::fail(Error::Procedure(
                            "command table is not ready".into(),
                        ));
                    };
                    let mut set = ResultSet::new(
                        vec!["command", "help"],
                        vec![ColumnType::Str, ColumnType::Str],
                    );
                    for spec in registry.all() {
                        set.rows.push(vec![json!(spec.method()), json!(spec.help)]);
                    }
                    CommandResult::ok(vec![set])
                }
            },
        );
    }

    registry.register(
        "manage",
        "help",
        "Describe one command: manage.help(group, command).",
        move |_ctx, params| {
            let slot = slot.clone();
            async move {
                let (args, _) = split_synchronous(params, true);
                let group = match arg_str(&args, 0, "group") {
                    Ok(group) => group,
                    Err(err) => return CommandResult::fail(err),
                };
                let command = arg_opt_str(&args, 1).unwrap_or_default();
                let method = format!("{group}.{command}");
                let Some(registry) = slot.get() else {
                    return CommandResult::fail(Error::Procedure(
                        "command table is not ready".into(),
                    ));
                };
                match registry.lookup(&method) {
                    Some(spec) => {
                        let mut set = ResultSet::new(
                            vec!["command", "help"],
                            vec![ColumnType::Str, ColumnType::Str],
                        );
                        set.rows.push(vec![json!(spec.method()), json!(spec.help)]);
                        CommandResult::ok(vec![set])
                    }
                    None => CommandResult::fail(Error::Procedure(format!(
                        "command ({group}, {command}) was not found"
                    ))),
                }
            }
        },
    );
}
