//! The `group.*` namespace.

use serde_json::json;

use herd_engine::JobSpec;
use herd_ha::ops::{arg_opt_str, arg_str};
use herd_types::{ColumnType, CommandResult, Error, ResultSet};

use crate::command::{
    group_locks, run_procedure_command, split_synchronous, CommandRegistry,
};

pub(crate) fn register(registry: &mut CommandRegistry) {
    registry.register(
        "group",
        "create",
        "Create a new group: group.create(group_id[, description]).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.create",
                group_locks(&group_id),
                vec![JobSpec::new("group.create", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "destroy",
        "Destroy an empty group: group.destroy(group_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.destroy",
                group_locks(&group_id),
                vec![JobSpec::new("group.destroy", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "add",
        "Add a server to a group: group.add(group_id, address).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.add",
                group_locks(&group_id),
                vec![JobSpec::new("group.add", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "remove",
        "Remove a server from a group: group.remove(group_id, server_uuid).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.remove",
                group_locks(&group_id),
                vec![JobSpec::new("group.remove", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "promote",
        "Promote the best secondary to primary: group.promote(group_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.promote",
                group_locks(&group_id),
                vec![JobSpec::new("group.promote", args.clone())
                    .with_undo("group.demote", json!([group_id]))],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "demote",
        "Demote the group's primary: group.demote(group_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.demote",
                group_locks(&group_id),
                vec![JobSpec::new("group.demote", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "activate",
        "Activate a group for monitoring: group.activate(group_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.activate",
                group_locks(&group_id),
                vec![JobSpec::new("group.activate", args.clone())
                    .with_undo("group.deactivate", json!([group_id]))],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "deactivate",
        "Deactivate a group: group.deactivate(group_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "group.deactivate",
                group_locks(&group_id),
                vec![JobSpec::new("group.deactivate", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "group",
        "lookup_groups",
        "List groups: group.lookup_groups([pattern]).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let pattern = arg_opt_str(&args, 0).unwrap_or_default();
            lookup_groups(&ctx, &pattern).await
        },
    );

    registry.register(
        "group",
        "lookup_servers",
        "List a group's servers: group.lookup_servers(group_id).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            lookup_servers(&ctx, &group_id).await
        },
    );

    registry.register(
        "group",
        "health",
        "Probe a group's members and report issues: group.health(group_id).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let group_id = match arg_str(&args, 0, "group_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            health(&ctx, &group_id).await
        },
    );
}

async fn lookup_groups(ctx: &crate::NodeContext, pattern: &str) -> CommandResult {
    let groups = match ctx.store.groups(pattern).await {
        Ok(groups) => groups,
        Err(err) => return CommandResult::fail(err),
    };
    let mut set = ResultSet::new(
        vec!["group_id", "description", "master_uuid", "status"],
        vec![
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Str,
        ],
    );
    for group in groups {
        set.rows.push(vec![
            json!(group.group_id),
            json!(group.description.unwrap_or_default()),
            json!(group
                .master_uuid
                .map(|u| u.to_string())
                .unwrap_or_default()),
            json!(group.status.as_str()),
        ]);
    }
    CommandResult::ok(vec![set])
}

async fn lookup_servers(ctx: &crate::NodeContext, group_id: &str) -> CommandResult {
    let group = match ctx.store.fetch_group(group_id).await {
        Ok(Some(group)) => group,
        Ok(None) => {
            return CommandResult::fail(Error::Group(format!(
                "group ({group_id}) does not exist"
            )))
        }
        Err(err) => return CommandResult::fail(err),
    };
    let servers = match ctx.store.servers_in_group(group_id).await {
        Ok(servers) => servers,
        Err(err) => return CommandResult::fail(err),
    };
    let mut set = ResultSet::new(
        vec!["uuid", "address", "status", "mode", "weight", "is_master"],
        vec![
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Float,
            ColumnType::Bool,
        ],
    );
    for server in servers {
        set.rows.push(vec![
            json!(server.uuid.to_string()),
            json!(server.address),
            json!(server.status.as_str()),
            json!(server.mode.as_str()),
            json!(server.weight),
            json!(group.master_uuid == Some(server.uuid)),
        ]);
    }
    CommandResult::ok(vec![set])
}

async fn health(ctx: &crate::NodeContext, group_id: &str) -> CommandResult {
    let (rows, issues) =
        match herd_ha::ops::health(&ctx.store, ctx.probe.as_ref(), group_id).await {
            Ok(health) => health,
            Err(err) => return CommandResult::fail(err),
        };
    let mut info = ResultSet::new(
        vec!["uuid", "address", "is_alive", "status", "is_master", "mode"],
        vec![
            ColumnType::Str,
            ColumnType::Str,
            ColumnType::Bool,
            ColumnType::Str,
            ColumnType::Bool,
            ColumnType::Str,
        ],
    );
    for row in rows {
        info.rows.push(vec![
            json!(row.uuid.to_string()),
            json!(row.address),
            json!(row.is_alive),
            json!(row.status.as_str()),
            json!(row.is_master),
            json!(row.mode.as_str()),
        ]);
    }
    let mut issue_set = ResultSet::new(vec!["issue"], vec![ColumnType::Str]);
    for issue in issues {
        issue_set.rows.push(vec![json!(issue)]);
    }
    CommandResult::ok(vec![info, issue_set])
}
