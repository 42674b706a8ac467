//! Action and event registration.
//!
//! Binds the administrative operations to the names the executor resolves,
//! and wires the built-in events to their handlers. Everything is registered
//! explicitly at daemon start; the checkpoint log only stores names, so the
//! same names must resolve to the same code on every boot.

use std::sync::Arc;

use serde_json::{json, Value};

use herd_engine::{ActionOutcome, ActionRegistry, JobSpec};
use herd_events::{EventRegistry, LockResolver, FAIL_OVER, NEW_SERVER_ADD, SERVER_LOST};
use herd_store::Store;
use herd_types::lock_set;

use crate::ops::{self, arg_opt_str, arg_str, arg_uuid, group_lock};
use crate::probe::ServerProbe;

/// Register every administrative action under its command name.
pub fn register_actions(
    actions: &mut ActionRegistry,
    store: Store,
    probe: Arc<dyn ServerProbe>,
) {
    {
        let store = store.clone();
        actions.register("group.create", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                let description = arg_opt_str(&args, 1);
                ops::create_group(&store, &group_id, description).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("group.destroy", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::destroy_group(&store, &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("group.add", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                let address = arg_str(&args, 1, "address")?;
                let uuid = ops::add_server(&store, &group_id, &address).await?;
                // Configuration runs as a follow-up job under the same lock.
                Ok(ActionOutcome::follow_up(vec![JobSpec::new(
                    "ha.configure_server",
                    json!([group_id, uuid.to_string()]),
                )]))
            }
        });
    }
    {
        let store = store.clone();
        actions.register("ha.configure_server", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                let uuid = arg_uuid(&args, 1, "server_uuid")?;
                ops::configure_server(&store, &group_id, uuid).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("group.remove", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                let uuid = arg_uuid(&args, 1, "server_uuid")?;
                ops::remove_server(&store, &group_id, uuid).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        let probe = probe.clone();
        actions.register("group.promote", move |args: Value| {
            let store = store.clone();
            let probe = probe.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::promote(&store, probe.as_ref(), &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("group.demote", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::demote(&store, &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        let probe = probe.clone();
        actions.register("group.activate", move |args: Value| {
            let store = store.clone();
            let probe = probe.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::activate_group(&store, probe.as_ref(), &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("group.deactivate", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::deactivate_group(&store, &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("ha.server_lost", move |args: Value| {
            let store = store.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                let uuid = arg_uuid(&args, 1, "server_uuid")?;
                ops::mark_server_lost(&store, &group_id, uuid).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        let probe = probe.clone();
        actions.register("ha.fail_over", move |args: Value| {
            let store = store.clone();
            let probe = probe.clone();
            async move {
                let group_id = arg_str(&args, 0, "group_id")?;
                ops::fail_over(&store, probe.as_ref(), &group_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("provider.register", move |args: Value| {
            let store = store.clone();
            async move {
                let provider = herd_store::Provider {
                    provider_id: arg_str(&args, 0, "provider_id")?,
                    kind: arg_str(&args, 1, "kind")?,
                    url: arg_str(&args, 2, "url")?,
                    user: arg_opt_str(&args, 3),
                    passwd: arg_opt_str(&args, 4),
                };
                store.add_provider(&provider).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("provider.unregister", move |args: Value| {
            let store = store.clone();
            async move {
                let provider_id = arg_str(&args, 0, "provider_id")?;
                store.remove_provider(&provider_id).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("machine.create", move |args: Value| {
            let store = store.clone();
            async move {
                let machine = herd_store::Machine {
                    machine_uuid: uuid::Uuid::new_v4(),
                    provider_id: arg_str(&args, 0, "provider_id")?,
                    image: arg_opt_str(&args, 1),
                    flavor: arg_opt_str(&args, 2),
                    addresses: None,
                };
                store.add_machine(&machine).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
    {
        let store = store.clone();
        actions.register("machine.destroy", move |args: Value| {
            let store = store.clone();
            async move {
                let machine_uuid = arg_uuid(&args, 0, "machine_uuid")?;
                store.remove_machine(machine_uuid).await?;
                Ok(ActionOutcome::done())
            }
        });
    }
}

/// Wire the built-in events to their handlers.
///
/// Every handler serializes on its group's lock, so synthetic events from
/// the failure detector queue up behind concurrent admin commands instead of
/// racing them.
pub fn register_events(events: &mut EventRegistry) {
    let by_group = || {
        LockResolver::Dynamic(Arc::new(|args: &Value| match args.get(0).and_then(Value::as_str) {
            Some(group_id) => lock_set([group_lock(group_id)]),
            None => lock_set(["group/unknown"]),
        }))
    };
    events.register(SERVER_LOST, "ha.server_lost", by_group());
    events.register(FAIL_OVER, "ha.fail_over", by_group());
    events.register(NEW_SERVER_ADD, "ha.configure_server", by_group());
}
