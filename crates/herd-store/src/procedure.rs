//! Procedure audit rows and the retention sweep.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use herd_types::{Error, LockSet};

use crate::{persistence_err, Store};

/// Audit row for one procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureRow {
    /// Procedure identity.
    pub uuid: Uuid,
    /// Procedure name, usually `group.promote`-style.
    pub name: String,
    /// Keys the procedure serializes on; recovery reruns it on the same set.
    pub locks: LockSet,
    /// When the procedure was enqueued.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal outcome, if any.
    pub success: Option<bool>,
}

fn row_to_procedure(row: &SqliteRow) -> Result<ProcedureRow, Error> {
    let uuid: String = row.try_get("uuid").map_err(persistence_err)?;
    let locks: String = row.try_get("locks_blob").map_err(persistence_err)?;
    let started_at: String = row.try_get("started_at").map_err(persistence_err)?;
    let finished_at: Option<String> = row.try_get("finished_at").map_err(persistence_err)?;
    let success: Option<i64> = row.try_get("success").map_err(persistence_err)?;
    Ok(ProcedureRow {
        uuid: Uuid::parse_str(&uuid)
            .map_err(|e| Error::Persistence(format!("bad uuid in procedures table: {e}")))?,
        name: row.try_get("name").map_err(persistence_err)?,
        locks: serde_json::from_str(&locks)
            .map_err(|e| Error::Persistence(format!("bad locks blob in procedures table: {e}")))?,
        started_at: parse_when(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_when).transpose()?,
        success: success.map(|s| s != 0),
    })
}

fn parse_when(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("bad timestamp in procedures table: {e}")))
}

impl Store {
    /// Record a freshly enqueued procedure.
    pub async fn insert_procedure(
        &self,
        uuid: Uuid,
        name: &str,
        locks: &LockSet,
    ) -> Result<(), Error> {
        let started_at = Utc::now().to_rfc3339();
        let locks_blob = serde_json::to_string(locks)
            .map_err(|e| Error::Persistence(format!("cannot serialize lock set: {e}")))?;
        self.retry("insert procedure", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO procedures (uuid, name, locks_blob, started_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(uuid.to_string())
            .bind(name)
            .bind(&locks_blob)
            .bind(&started_at)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Mark a procedure terminal inside the same transaction as its final
    /// checkpoint and statistics increment.
    pub async fn finish_procedure_tx(
        conn: &mut SqliteConnection,
        uuid: Uuid,
        success: bool,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE procedures SET finished_at = ?, success = ? WHERE uuid = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(success as i64)
            .bind(uuid.to_string())
            .execute(conn)
            .await
            .map_err(persistence_err)?;
        Ok(())
    }

    /// Fetch one procedure's audit row.
    pub async fn fetch_procedure(&self, uuid: Uuid) -> Result<Option<ProcedureRow>, Error> {
        let row = self
            .retry("fetch procedure", || async {
                sqlx::query("SELECT * FROM procedures WHERE uuid = ?")
                    .bind(uuid.to_string())
                    .fetch_optional(self.pool())
                    .await
            })
            .await?;
        row.as_ref().map(row_to_procedure).transpose()
    }

    /// Delete terminal procedures (and their checkpoints) older than the
    /// retention window. Returns the uuids that were purged so in-memory
    /// caches can drop their handles too.
    pub async fn purge_terminal(&self, retention: Duration) -> Result<Vec<Uuid>, Error> {
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT uuid FROM procedures WHERE finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(persistence_err)?;
        let mut purged = Vec::with_capacity(rows.len());
        for row in &rows {
            let uuid: String = row.try_get("uuid").map_err(persistence_err)?;
            purged.push(
                Uuid::parse_str(&uuid)
                    .map_err(|e| Error::Persistence(format!("bad uuid in procedures table: {e}")))?,
            );
        }
        sqlx::query(
            "DELETE FROM checkpoints WHERE proc_uuid IN \
             (SELECT uuid FROM procedures WHERE finished_at IS NOT NULL AND finished_at < ?)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(persistence_err)?;
        sqlx::query("DELETE FROM procedures WHERE finished_at IS NOT NULL AND finished_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(persistence_err)?;
        tx.commit().await.map_err(persistence_err)?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_finish() {
        let store = Store::in_memory().await.unwrap();
        let uuid = Uuid::new_v4();
        let locks = herd_types::lock_set(["group/g1"]);
        store
            .insert_procedure(uuid, "group.promote", &locks)
            .await
            .unwrap();

        let row = store.fetch_procedure(uuid).await.unwrap().unwrap();
        assert_eq!(row.name, "group.promote");
        assert_eq!(row.locks, locks);
        assert!(row.finished_at.is_none());

        let mut tx = store.begin().await.unwrap();
        Store::finish_procedure_tx(&mut tx, uuid, true).await.unwrap();
        tx.commit().await.unwrap();

        let row = store.fetch_procedure(uuid).await.unwrap().unwrap();
        assert_eq!(row.success, Some(true));
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn retention_only_purges_terminal_rows() {
        let store = Store::in_memory().await.unwrap();
        let running = Uuid::new_v4();
        let finished = Uuid::new_v4();
        let locks = herd_types::LockSet::new();
        store.insert_procedure(running, "a", &locks).await.unwrap();
        store.insert_procedure(finished, "b", &locks).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::finish_procedure_tx(&mut tx, finished, true).await.unwrap();
        tx.commit().await.unwrap();

        // A negative window purges everything terminal, nothing running.
        let purged = store.purge_terminal(Duration::seconds(-1)).await.unwrap();
        assert_eq!(purged, vec![finished]);
        assert!(store.fetch_procedure(running).await.unwrap().is_some());
        assert!(store.fetch_procedure(finished).await.unwrap().is_none());
    }
}
