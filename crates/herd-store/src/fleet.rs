//! Group and server tables.
//!
//! The persistence store owns the canonical fleet state; the typed methods
//! here are the only write path. Status changes go through the transition
//! matrix in `herd-types`, so an illegal transition is rejected before it
//! reaches the database.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use herd_types::{Error, Group, GroupStatus, Server, ServerMode, ServerStatus};

use crate::{persistence_err, Store};

fn row_to_group(row: &SqliteRow) -> Result<Group, Error> {
    let master: Option<String> = row.try_get("master_uuid").map_err(persistence_err)?;
    let status: String = row.try_get("status").map_err(persistence_err)?;
    Ok(Group {
        group_id: row.try_get("group_id").map_err(persistence_err)?,
        description: row.try_get("description").map_err(persistence_err)?,
        master_uuid: master
            .map(|m| Uuid::parse_str(&m))
            .transpose()
            .map_err(|e| Error::Persistence(format!("bad master uuid in groups table: {e}")))?,
        status: GroupStatus::parse(&status)?,
    })
}

fn row_to_server(row: &SqliteRow) -> Result<Server, Error> {
    let uuid: String = row.try_get("uuid").map_err(persistence_err)?;
    let mode: String = row.try_get("mode").map_err(persistence_err)?;
    let status: String = row.try_get("status").map_err(persistence_err)?;
    Ok(Server {
        uuid: Uuid::parse_str(&uuid)
            .map_err(|e| Error::Persistence(format!("bad uuid in servers table: {e}")))?,
        group_id: row.try_get("group_id").map_err(persistence_err)?,
        address: row.try_get("address").map_err(persistence_err)?,
        user: row.try_get("user").map_err(persistence_err)?,
        passwd: row.try_get("passwd").map_err(persistence_err)?,
        mode: ServerMode::parse(&mode)?,
        status: ServerStatus::parse(&status)?,
        weight: row.try_get("weight").map_err(persistence_err)?,
    })
}

impl Store {
    //───────────────────── groups ─────────────────────

    /// Insert a new group; fails if the id is taken.
    pub async fn add_group(&self, group: &Group) -> Result<(), Error> {
        group.validate()?;
        if self.fetch_group(&group.group_id).await?.is_some() {
            return Err(Error::Group(format!(
                "group ({}) already exists",
                group.group_id
            )));
        }
        self.retry("add group", || async {
            sqlx::query(
                "INSERT INTO groups (group_id, description, master_uuid, status) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&group.group_id)
            .bind(&group.description)
            .bind(group.master_uuid.map(|u| u.to_string()))
            .bind(group.status.as_str())
            .execute(self.pool())
            .await
        })
        .await?;
        self.bump_version();
        Ok(())
    }

    /// Fetch a group by id.
    pub async fn fetch_group(&self, group_id: &str) -> Result<Option<Group>, Error> {
        let row = self
            .retry("fetch group", || async {
                sqlx::query("SELECT * FROM groups WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_optional(self.pool())
                    .await
            })
            .await?;
        row.as_ref().map(row_to_group).transpose()
    }

    /// All groups whose id starts with `pattern` (all groups when empty),
    /// ordered by id.
    pub async fn groups(&self, pattern: &str) -> Result<Vec<Group>, Error> {
        let like = format!("{pattern}%");
        let rows = self
            .retry("list groups", || async {
                sqlx::query("SELECT * FROM groups WHERE group_id LIKE ? ORDER BY group_id")
                    .bind(&like)
                    .fetch_all(self.pool())
                    .await
            })
            .await?;
        rows.iter().map(row_to_group).collect()
    }

    /// All groups with the given activation status, ordered by id.
    pub async fn groups_by_status(&self, status: GroupStatus) -> Result<Vec<Group>, Error> {
        let rows = self
            .retry("list groups by status", || async {
                sqlx::query("SELECT * FROM groups WHERE status = ? ORDER BY group_id")
                    .bind(status.as_str())
                    .fetch_all(self.pool())
                    .await
            })
            .await?;
        rows.iter().map(row_to_group).collect()
    }

    /// Change a group's activation status.
    pub async fn set_group_status(&self, group_id: &str, status: GroupStatus) -> Result<(), Error> {
        let done = self
            .retry("set group status", || async {
                sqlx::query("UPDATE groups SET status = ? WHERE group_id = ?")
                    .bind(status.as_str())
                    .bind(group_id)
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Group(format!("group ({group_id}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }

    /// Point a group at a new primary (or clear it).
    pub async fn set_group_master(
        &self,
        group_id: &str,
        master: Option<Uuid>,
    ) -> Result<(), Error> {
        let done = self
            .retry("set group master", || async {
                sqlx::query("UPDATE groups SET master_uuid = ? WHERE group_id = ?")
                    .bind(master.map(|u| u.to_string()))
                    .bind(group_id)
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Group(format!("group ({group_id}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }

    /// Remove an empty group.
    pub async fn remove_group(&self, group_id: &str) -> Result<(), Error> {
        if !self.servers_in_group(group_id).await?.is_empty() {
            return Err(Error::Group(format!(
                "group ({group_id}) still has servers"
            )));
        }
        let done = self
            .retry("remove group", || async {
                sqlx::query("DELETE FROM groups WHERE group_id = ?")
                    .bind(group_id)
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Group(format!("group ({group_id}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }

    //───────────────────── servers ─────────────────────

    /// Insert a new server; fails if the uuid is taken.
    pub async fn add_server(&self, server: &Server) -> Result<(), Error> {
        server.validate()?;
        if self.fetch_server(server.uuid).await?.is_some() {
            return Err(Error::Server(format!(
                "server ({}) already exists",
                server.uuid
            )));
        }
        self.retry("add server", || async {
            sqlx::query(
                "INSERT INTO servers (uuid, group_id, address, user, passwd, mode, status, weight) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(server.uuid.to_string())
            .bind(&server.group_id)
            .bind(&server.address)
            .bind(&server.user)
            .bind(&server.passwd)
            .bind(server.mode.as_str())
            .bind(server.status.as_str())
            .bind(server.weight)
            .execute(self.pool())
            .await
        })
        .await?;
        self.bump_version();
        Ok(())
    }

    /// Fetch a server by uuid.
    pub async fn fetch_server(&self, uuid: Uuid) -> Result<Option<Server>, Error> {
        let row = self
            .retry("fetch server", || async {
                sqlx::query("SELECT * FROM servers WHERE uuid = ?")
                    .bind(uuid.to_string())
                    .fetch_optional(self.pool())
                    .await
            })
            .await?;
        row.as_ref().map(row_to_server).transpose()
    }

    /// Find a server by its `host:port` address.
    pub async fn fetch_server_by_address(&self, address: &str) -> Result<Option<Server>, Error> {
        let row = self
            .retry("fetch server by address", || async {
                sqlx::query("SELECT * FROM servers WHERE address = ?")
                    .bind(address)
                    .fetch_optional(self.pool())
                    .await
            })
            .await?;
        row.as_ref().map(row_to_server).transpose()
    }

    /// Members of a group, ordered by uuid for deterministic output.
    pub async fn servers_in_group(&self, group_id: &str) -> Result<Vec<Server>, Error> {
        let rows = self
            .retry("list group servers", || async {
                sqlx::query("SELECT * FROM servers WHERE group_id = ? ORDER BY uuid")
                    .bind(group_id)
                    .fetch_all(self.pool())
                    .await
            })
            .await?;
        rows.iter().map(row_to_server).collect()
    }

    /// Move a server through the status matrix.
    pub async fn set_server_status(
        &self,
        uuid: Uuid,
        status: ServerStatus,
    ) -> Result<(), Error> {
        let current = self
            .fetch_server(uuid)
            .await?
            .ok_or_else(|| Error::Server(format!("server ({uuid}) does not exist")))?;
        if !current.status.can_transition(status) {
            return Err(Error::Server(format!(
                "server ({uuid}) cannot move from {} to {}",
                current.status, status
            )));
        }
        self.retry("set server status", || async {
            sqlx::query("UPDATE servers SET status = ? WHERE uuid = ?")
                .bind(status.as_str())
                .bind(uuid.to_string())
                .execute(self.pool())
                .await
        })
        .await?;
        self.bump_version();
        Ok(())
    }

    /// Change a server's read/write mode.
    pub async fn set_server_mode(&self, uuid: Uuid, mode: ServerMode) -> Result<(), Error> {
        let done = self
            .retry("set server mode", || async {
                sqlx::query("UPDATE servers SET mode = ? WHERE uuid = ?")
                    .bind(mode.as_str())
                    .bind(uuid.to_string())
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Server(format!("server ({uuid}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }

    /// Attach a server to a group (or detach it with `None`).
    pub async fn set_server_group(
        &self,
        uuid: Uuid,
        group_id: Option<&str>,
    ) -> Result<(), Error> {
        let done = self
            .retry("set server group", || async {
                sqlx::query("UPDATE servers SET group_id = ? WHERE uuid = ?")
                    .bind(group_id)
                    .bind(uuid.to_string())
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Server(format!("server ({uuid}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }

    /// Delete a server row.
    pub async fn remove_server(&self, uuid: Uuid) -> Result<(), Error> {
        let done = self
            .retry("remove server", || async {
                sqlx::query("DELETE FROM servers WHERE uuid = ?")
                    .bind(uuid.to_string())
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Server(format!("server ({uuid}) does not exist")));
        }
        self.bump_version();
        Ok(())
    }
}

//─────────────────────────────
//  Transaction-scoped helpers
//─────────────────────────────

/// Set a server's status inside an open transaction, honoring the matrix.
pub async fn set_server_status_tx(
    conn: &mut SqliteConnection,
    uuid: Uuid,
    status: ServerStatus,
) -> Result<(), Error> {
    let row = sqlx::query("SELECT status FROM servers WHERE uuid = ?")
        .bind(uuid.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(persistence_err)?
        .ok_or_else(|| Error::Server(format!("server ({uuid}) does not exist")))?;
    let current: String = row.try_get("status").map_err(persistence_err)?;
    let current = ServerStatus::parse(&current)?;
    if !current.can_transition(status) {
        return Err(Error::Server(format!(
            "server ({uuid}) cannot move from {current} to {status}"
        )));
    }
    sqlx::query("UPDATE servers SET status = ? WHERE uuid = ?")
        .bind(status.as_str())
        .bind(uuid.to_string())
        .execute(conn)
        .await
        .map_err(persistence_err)?;
    Ok(())
}

/// Set a server's mode inside an open transaction.
pub async fn set_server_mode_tx(
    conn: &mut SqliteConnection,
    uuid: Uuid,
    mode: ServerMode,
) -> Result<(), Error> {
    sqlx::query("UPDATE servers SET mode = ? WHERE uuid = ?")
        .bind(mode.as_str())
        .bind(uuid.to_string())
        .execute(conn)
        .await
        .map_err(persistence_err)?;
    Ok(())
}

/// Point a group at a new primary inside an open transaction.
pub async fn set_group_master_tx(
    conn: &mut SqliteConnection,
    group_id: &str,
    master: Option<Uuid>,
) -> Result<(), Error> {
    sqlx::query("UPDATE groups SET master_uuid = ? WHERE group_id = ?")
        .bind(master.map(|u| u.to_string()))
        .bind(group_id)
        .execute(conn)
        .await
        .map_err(persistence_err)?;
    Ok(())
}
