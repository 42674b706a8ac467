//! The `statistics.*` namespace.

use serde_json::json;

use herd_ha::ops::arg_opt_str;
use herd_store::StatRow;
use herd_types::{ColumnType, CommandResult, ResultSet};

use crate::command::{split_synchronous, CommandRegistry};

fn stat_rows(key_column: &'static str, stats: Vec<StatRow>) -> ResultSet {
    let mut set = ResultSet::new(
        vec![key_column, "call_count", "call_abort"],
        vec![ColumnType::Str, ColumnType::Int, ColumnType::Int],
    );
    for stat in stats {
        set.rows
            .push(vec![json!(stat.key), json!(stat.call_count), json!(stat.call_abort)]);
    }
    set
}

pub(crate) fn register(registry: &mut CommandRegistry) {
    registry.register(
        "statistics",
        "node",
        "Report the node's identity and uptime: statistics.node().",
        |ctx, _params| async move {
            let mut set = ResultSet::new(
                vec!["node_uuid", "uptime", "started_at"],
                vec![ColumnType::Str, ColumnType::Int, ColumnType::Str],
            );
            set.rows.push(vec![
                json!(ctx.node_uuid.to_string()),
                json!(ctx.uptime_secs()),
                json!(ctx.started_at.to_rfc3339()),
            ]);
            CommandResult::ok(vec![set])
        },
    );

    registry.register(
        "statistics",
        "group",
        "Promotion/demotion counters per group: statistics.group([pattern]).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let pattern = arg_opt_str(&args, 0).unwrap_or_default();
            match ctx.store.group_stats(&pattern).await {
                Ok(stats) => CommandResult::ok(vec![stat_rows("group_id", stats)]),
                Err(err) => CommandResult::fail(err),
            }
        },
    );

    registry.register(
        "statistics",
        "procedure",
        "Execution counters per procedure: statistics.procedure([pattern]).",
        |ctx, params| async move {
            let (args, _) = split_synchronous(params, true);
            let pattern = arg_opt_str(&args, 0).unwrap_or_default();
            match ctx.store.procedure_stats(&pattern).await {
                Ok(stats) => CommandResult::ok(vec![stat_rows("proc_name", stats)]),
                Err(err) => CommandResult::fail(err),
            }
        },
    );
}
