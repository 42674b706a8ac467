//! Administrative operations on groups and servers.
//!
//! These are the bodies of the mutating commands. They run inside procedure
//! jobs, so by the time one of them executes, the executor already holds the
//! group's lock; the functions only have to keep the persistent state
//! consistent. Topology changes (promotion, demotion, failover) commit the
//! status flips, the master pointer and the group counters in a single
//! transaction.

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use herd_store::fleet::{set_group_master_tx, set_server_mode_tx, set_server_status_tx};
use herd_store::stats::{bump_tx, SCOPE_GROUP};
use herd_store::Store;
use herd_types::{
    Error, Group, GroupStatus, Server, ServerMode, ServerStatus,
};

use crate::probe::ServerProbe;

/// Lock key protecting a group and its topology.
pub fn group_lock(group_id: &str) -> String {
    format!("group/{group_id}")
}

/// Lock key protecting a single server.
pub fn server_lock(uuid: Uuid) -> String {
    format!("server/{uuid}")
}

/// Health of one group member, as reported by `group.health`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHealth {
    /// The member's identity.
    pub uuid: Uuid,
    /// The member's address.
    pub address: String,
    /// Whether the member answered a probe just now.
    pub is_alive: bool,
    /// The member's administrative status.
    pub status: ServerStatus,
    /// Whether the member is the group's primary.
    pub is_master: bool,
    /// The member's read/write mode.
    pub mode: ServerMode,
}

async fn fetch_group_or_err(store: &Store, group_id: &str) -> Result<Group, Error> {
    store
        .fetch_group(group_id)
        .await?
        .ok_or_else(|| Error::Group(format!("group ({group_id}) does not exist")))
}

async fn fetch_server_or_err(store: &Store, uuid: Uuid) -> Result<Server, Error> {
    store
        .fetch_server(uuid)
        .await?
        .ok_or_else(|| Error::Server(format!("server ({uuid}) does not exist")))
}

//─────────────────────────────
//  Group lifecycle
//─────────────────────────────

/// Create a new, inactive group.
pub async fn create_group(
    store: &Store,
    group_id: &str,
    description: Option<String>,
) -> Result<(), Error> {
    let group = Group::new(group_id, description);
    group.validate()?;
    store.add_group(&group).await?;
    info!(group_id, "group created");
    Ok(())
}

/// Destroy an empty group.
pub async fn destroy_group(store: &Store, group_id: &str) -> Result<(), Error> {
    fetch_group_or_err(store, group_id).await?;
    store.remove_group(group_id).await?;
    info!(group_id, "group destroyed");
    Ok(())
}

/// Mark a group active; faulty members that answer probes again come back
/// as spares (operator re-activation).
pub async fn activate_group(
    store: &Store,
    probe: &dyn ServerProbe,
    group_id: &str,
) -> Result<(), Error> {
    fetch_group_or_err(store, group_id).await?;
    for server in store.servers_in_group(group_id).await? {
        if server.status == ServerStatus::Faulty && probe.is_alive(&server.address).await {
            store
                .set_server_status(server.uuid, ServerStatus::Spare)
                .await?;
            info!(group_id, server = %server.uuid, "faulty server re-activated as spare");
        }
    }
    store.set_group_status(group_id, GroupStatus::Active).await?;
    info!(group_id, "group activated");
    Ok(())
}

/// Mark a group inactive; the failure detector stops watching it.
pub async fn deactivate_group(store: &Store, group_id: &str) -> Result<(), Error> {
    fetch_group_or_err(store, group_id).await?;
    store
        .set_group_status(group_id, GroupStatus::Inactive)
        .await?;
    info!(group_id, "group deactivated");
    Ok(())
}

//─────────────────────────────
//  Membership
//─────────────────────────────

/// Add a server to a group by address. Returns the new server's uuid; the
/// caller follows up with [`configure_server`] to bring it into the
/// topology.
pub async fn add_server(store: &Store, group_id: &str, address: &str) -> Result<Uuid, Error> {
    fetch_group_or_err(store, group_id).await?;
    if let Some(existing) = store.fetch_server_by_address(address).await? {
        return Err(Error::Server(format!(
            "server ({address}) is already registered as ({})",
            existing.uuid
        )));
    }
    let mut server = Server::new(Uuid::new_v4(), address);
    server.group_id = Some(group_id.to_string());
    store.add_server(&server).await?;
    info!(group_id, server = %server.uuid, address, "server added");
    Ok(server.uuid)
}

/// Move a freshly added server from `Configuring` into the replication
/// topology as a read-only secondary. A server already past configuration
/// is left alone.
pub async fn configure_server(store: &Store, group_id: &str, uuid: Uuid) -> Result<(), Error> {
    let server = fetch_server_or_err(store, uuid).await?;
    if server.group_id.as_deref() != Some(group_id) {
        return Err(Error::Server(format!(
            "server ({uuid}) is not a member of group ({group_id})"
        )));
    }
    if server.status != ServerStatus::Configuring {
        return Ok(());
    }
    store
        .set_server_status(uuid, ServerStatus::Secondary)
        .await?;
    store.set_server_mode(uuid, ServerMode::ReadOnly).await?;
    info!(group_id, server = %uuid, "server configured as secondary");
    Ok(())
}

/// Remove a server from a group. The group's primary cannot be removed;
/// demote it first.
pub async fn remove_server(store: &Store, group_id: &str, uuid: Uuid) -> Result<(), Error> {
    let group = fetch_group_or_err(store, group_id).await?;
    let server = fetch_server_or_err(store, uuid).await?;
    if server.group_id.as_deref() != Some(group_id) {
        return Err(Error::Server(format!(
            "server ({uuid}) is not a member of group ({group_id})"
        )));
    }
    if group.master_uuid == Some(uuid) {
        return Err(Error::Server(format!(
            "server ({uuid}) is the primary of group ({group_id})"
        )));
    }
    store.remove_server(uuid).await?;
    info!(group_id, server = %uuid, "server removed");
    Ok(())
}

//─────────────────────────────
//  Promotion / demotion
//─────────────────────────────

/// Pick the best promotion candidate: a probe-alive secondary with the
/// highest weight, ties broken by lowest uuid for determinism.
async fn elect_candidate(
    store: &Store,
    probe: &dyn ServerProbe,
    group_id: &str,
) -> Result<Option<Server>, Error> {
    let mut candidates = Vec::new();
    for server in store.servers_in_group(group_id).await? {
        if server.status == ServerStatus::Secondary && probe.is_alive(&server.address).await {
            candidates.push(server);
        }
    }
    candidates.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| a.uuid.cmp(&b.uuid))
    });
    Ok(candidates.into_iter().next())
}

/// Promote a member to primary.
///
/// When the group already has a reachable primary this is a no-op success
/// and no promotion is counted; concurrent promotes therefore record exactly
/// one promotion between them.
pub async fn promote(
    store: &Store,
    probe: &dyn ServerProbe,
    group_id: &str,
) -> Result<Option<Uuid>, Error> {
    let group = fetch_group_or_err(store, group_id).await?;

    if let Some(master_uuid) = group.master_uuid {
        let master = fetch_server_or_err(store, master_uuid).await?;
        if master.status == ServerStatus::Primary && probe.is_alive(&master.address).await {
            info!(group_id, master = %master_uuid, "group already has a reachable primary");
            return Ok(None);
        }
    }

    let candidate = elect_candidate(store, probe, group_id)
        .await?
        .ok_or_else(|| {
            Error::Group(format!(
                "group ({group_id}) has no promotable secondary"
            ))
        })?;

    let mut tx = store.begin().await?;
    if let Some(master_uuid) = group.master_uuid {
        // The old primary is unreachable or already off the throne; make the
        // state say so before installing its successor.
        set_server_status_tx(&mut tx, master_uuid, ServerStatus::Faulty).await?;
    }
    set_server_status_tx(&mut tx, candidate.uuid, ServerStatus::Primary).await?;
    set_server_mode_tx(&mut tx, candidate.uuid, ServerMode::ReadWrite).await?;
    set_group_master_tx(&mut tx, group_id, Some(candidate.uuid)).await?;
    bump_tx(&mut tx, SCOPE_GROUP, group_id, 1, 0).await?;
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
    store.bump_version();
    info!(group_id, primary = %candidate.uuid, "server promoted");
    Ok(Some(candidate.uuid))
}

/// Demote the group's primary back to a read-only secondary.
pub async fn demote(store: &Store, group_id: &str) -> Result<(), Error> {
    let group = fetch_group_or_err(store, group_id).await?;
    let master_uuid = group
        .master_uuid
        .ok_or_else(|| Error::Group(format!("group ({group_id}) has no primary")))?;

    let mut tx = store.begin().await?;
    set_server_status_tx(&mut tx, master_uuid, ServerStatus::Secondary).await?;
    set_server_mode_tx(&mut tx, master_uuid, ServerMode::ReadOnly).await?;
    set_group_master_tx(&mut tx, group_id, None).await?;
    bump_tx(&mut tx, SCOPE_GROUP, group_id, 0, 1).await?;
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
    store.bump_version();
    info!(group_id, demoted = %master_uuid, "primary demoted");
    Ok(())
}

//─────────────────────────────
//  Failure handling
//─────────────────────────────

/// Record that a non-primary member was lost: it becomes faulty.
pub async fn mark_server_lost(store: &Store, group_id: &str, uuid: Uuid) -> Result<(), Error> {
    let server = fetch_server_or_err(store, uuid).await?;
    if server.group_id.as_deref() != Some(group_id) {
        return Err(Error::Server(format!(
            "server ({uuid}) is not a member of group ({group_id})"
        )));
    }
    if server.status == ServerStatus::Faulty {
        return Ok(());
    }
    store.set_server_status(uuid, ServerStatus::Faulty).await?;
    warn!(group_id, server = %uuid, "server lost");
    Ok(())
}

/// Fail over a group whose primary was lost: mark the old primary faulty
/// and install the best reachable secondary in its place.
pub async fn fail_over(
    store: &Store,
    probe: &dyn ServerProbe,
    group_id: &str,
) -> Result<Uuid, Error> {
    let group = fetch_group_or_err(store, group_id).await?;
    let old_master = group.master_uuid;
    let old_master_status = match old_master {
        Some(master_uuid) => Some(fetch_server_or_err(store, master_uuid).await?.status),
        None => None,
    };

    let candidate = elect_candidate(store, probe, group_id).await?;

    let mut tx = store.begin().await?;
    if let (Some(master_uuid), Some(status)) = (old_master, old_master_status) {
        if status != ServerStatus::Faulty {
            set_server_status_tx(&mut tx, master_uuid, ServerStatus::Faulty).await?;
        }
    }
    let Some(candidate) = candidate else {
        // No successor: record the headless group and surface the failure.
        set_group_master_tx(&mut tx, group_id, None).await?;
        tx.commit()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?;
        store.bump_version();
        return Err(Error::Group(format!(
            "group ({group_id}) has no promotable secondary to fail over to"
        )));
    };
    set_server_status_tx(&mut tx, candidate.uuid, ServerStatus::Primary).await?;
    set_server_mode_tx(&mut tx, candidate.uuid, ServerMode::ReadWrite).await?;
    set_group_master_tx(&mut tx, group_id, Some(candidate.uuid)).await?;
    bump_tx(&mut tx, SCOPE_GROUP, group_id, 1, 0).await?;
    tx.commit()
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
    store.bump_version();
    warn!(group_id, old = ?old_master, new = %candidate.uuid, "failed over");
    Ok(candidate.uuid)
}

//─────────────────────────────
//  Health
//─────────────────────────────

/// Probe every member of a group and collect topology issues.
pub async fn health(
    store: &Store,
    probe: &dyn ServerProbe,
    group_id: &str,
) -> Result<(Vec<ServerHealth>, Vec<String>), Error> {
    let group = fetch_group_or_err(store, group_id).await?;
    let mut rows = Vec::new();
    let mut issues = Vec::new();

    if group.master_uuid.is_none() {
        issues.push(format!("Group ({group_id}) has no primary."));
    }

    for server in store.servers_in_group(group_id).await? {
        let is_alive = probe.is_alive(&server.address).await;
        let is_master = group.master_uuid == Some(server.uuid);
        if is_master && is_alive && server.mode != ServerMode::ReadWrite {
            issues.push(format!(
                "Primary ({}) is reachable but not writable.",
                server.uuid
            ));
        }
        rows.push(ServerHealth {
            uuid: server.uuid,
            address: server.address.clone(),
            is_alive,
            status: server.status,
            is_master,
            mode: server.mode,
        });
    }
    Ok((rows, issues))
}

//─────────────────────────────
//  Argument helpers
//─────────────────────────────

/// Read a required string argument from a JSON argument array.
pub fn arg_str(args: &Value, idx: usize, what: &str) -> Result<String, Error> {
    args.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Procedure(format!("missing argument ({what})")))
}

/// Read an optional string argument from a JSON argument array.
pub fn arg_opt_str(args: &Value, idx: usize) -> Option<String> {
    args.get(idx).and_then(Value::as_str).map(str::to_string)
}

/// Read a required uuid argument from a JSON argument array.
pub fn arg_uuid(args: &Value, idx: usize, what: &str) -> Result<Uuid, Error> {
    let raw = arg_str(args, idx, what)?;
    Uuid::parse_str(&raw).map_err(|_| Error::Procedure(format!("bad uuid argument ({what})")))
}
