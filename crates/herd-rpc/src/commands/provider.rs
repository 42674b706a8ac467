//! The `provider.*` and `machine.*` namespaces.

use serde_json::json;

use herd_engine::JobSpec;
use herd_ha::ops::{arg_opt_str, arg_str};
use herd_types::{lock_set, ColumnType, CommandResult, ResultSet};

use crate::command::{run_procedure_command, split_synchronous, CommandRegistry};

pub(crate) fn register(registry: &mut CommandRegistry) {
    registry.register(
        "provider",
        "register",
        "Register a machine provider: \
         provider.register(provider_id, kind, url[, user[, passwd]]).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let provider_id = match arg_str(&args, 0, "provider_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "provider.register",
                lock_set([format!("provider/{provider_id}")]),
                vec![JobSpec::new("provider.register", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "provider",
        "unregister",
        "Unregister a provider with no machines: provider.unregister(provider_id).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let provider_id = match arg_str(&args, 0, "provider_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "provider.unregister",
                lock_set([format!("provider/{provider_id}")]),
                vec![JobSpec::new("provider.unregister", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "provider",
        "list",
        "List registered providers: provider.list().",
        |ctx, _params| async move {
            let providers = match ctx.store.providers().await {
                Ok(providers) => providers,
                Err(err) => return CommandResult::fail(err),
            };
            let mut set = ResultSet::new(
                vec!["provider_id", "kind", "url"],
                vec![ColumnType::Str, ColumnType::Str, ColumnType::Str],
            );
            for provider in providers {
                set.rows.push(vec![
                    json!(provider.provider_id),
                    json!(provider.kind),
                    json!(provider.url),
                ]);
            }
            CommandResult::ok(vec![set])
        },
    );

    registry.register(
        "machine",
        "create",
        "Book a machine on a provider: machine.create(provider_id[, image[, flavor]]).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let provider_id = match arg_str(&args, 0, "provider_id") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "machine.create",
                lock_set([format!("provider/{provider_id}")]),
                vec![JobSpec::new("machine.create", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "machine",
        "destroy",
        "Destroy a booked machine: machine.destroy(machine_uuid).",
        |ctx, params| async move {
            let (args, synchronous) = split_synchronous(params, true);
            let machine_uuid = match arg_str(&args, 0, "machine_uuid") {
                Ok(id) => id,
                Err(err) => return CommandResult::fail(err),
            };
            run_procedure_command(
                &ctx,
                "machine.destroy",
                lock_set([format!("machine/{machine_uuid}")]),
                vec![JobSpec::new("machine.destroy", args)],
                synchronous,
            )
            .await
        },
    );

    registry.register(
        "machine",
        "list",
        "List booked machines: machine.list([provider_id]).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let provider_id = arg_opt_str(&args, 0);
            let machines = match ctx.store.machines(provider_id.as_deref()).await {
                Ok(machines) => machines,
                Err(err) => return CommandResult::fail(err),
            };
            let mut set = ResultSet::new(
                vec!["machine_uuid", "provider_id", "image", "flavor"],
                vec![
                    ColumnType::Str,
                    ColumnType::Str,
                    ColumnType::Str,
                    ColumnType::Str,
                ],
            );
            for machine in machines {
                set.rows.push(vec![
                    json!(machine.machine_uuid.to_string()),
                    json!(machine.provider_id),
                    json!(machine.image.unwrap_or_default()),
                    json!(machine.flavor.unwrap_or_default()),
                ]);
            }
            CommandResult::ok(vec![set])
        },
    );
}
