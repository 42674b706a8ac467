//! Statistics counters.
//!
//! Two scopes: `procedure` (key = procedure name, call_count = executions,
//! call_abort = aborted executions) and `group` (key = group id, call_count
//! = promotions, call_abort = demotions). Increments happen inside the same
//! transaction as the final checkpoint or the topology change they count, so
//! the counters can never disagree with the audit log.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use herd_types::Error;

use crate::{persistence_err, Store};

/// Scope key for procedure execution counters.
pub const SCOPE_PROCEDURE: &str = "procedure";

/// Scope key for group promotion/demotion counters.
pub const SCOPE_GROUP: &str = "group";

/// One statistics row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRow {
    /// Procedure name or group id, depending on scope.
    pub key: String,
    /// Executions or promotions.
    pub call_count: i64,
    /// Aborts or demotions.
    pub call_abort: i64,
}

fn row_to_stat(row: &SqliteRow) -> Result<StatRow, Error> {
    Ok(StatRow {
        key: row.try_get("key").map_err(persistence_err)?,
        call_count: row.try_get("call_count").map_err(persistence_err)?,
        call_abort: row.try_get("call_abort").map_err(persistence_err)?,
    })
}

/// Add to a counter pair inside an open transaction.
pub async fn bump_tx(
    conn: &mut SqliteConnection,
    scope: &str,
    key: &str,
    calls: i64,
    aborts: i64,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO statistics (scope, key, call_count, call_abort) VALUES (?, ?, ?, ?) \
         ON CONFLICT(scope, key) DO UPDATE SET \
             call_count = call_count + excluded.call_count, \
             call_abort = call_abort + excluded.call_abort",
    )
    .bind(scope)
    .bind(key)
    .bind(calls)
    .bind(aborts)
    .execute(conn)
    .await
    .map_err(persistence_err)?;
    Ok(())
}

impl Store {
    /// Procedure counters whose name starts with `pattern` (all when empty),
    /// ordered by name.
    pub async fn procedure_stats(&self, pattern: &str) -> Result<Vec<StatRow>, Error> {
        self.stats_view(SCOPE_PROCEDURE, pattern).await
    }

    /// Group counters whose id starts with `pattern` (all when empty),
    /// ordered by id.
    pub async fn group_stats(&self, pattern: &str) -> Result<Vec<StatRow>, Error> {
        self.stats_view(SCOPE_GROUP, pattern).await
    }

    async fn stats_view(&self, scope: &str, pattern: &str) -> Result<Vec<StatRow>, Error> {
        let like = format!("{pattern}%");
        let rows = self
            .retry("read statistics", || async {
                sqlx::query(
                    "SELECT key, call_count, call_abort FROM statistics \
                     WHERE scope = ? AND key LIKE ? ORDER BY key",
                )
                .bind(scope)
                .bind(&like)
                .fetch_all(self.pool())
                .await
            })
            .await?;
        rows.iter().map(row_to_stat).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate() {
        let store = Store::in_memory().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        bump_tx(&mut tx, SCOPE_PROCEDURE, "group.promote", 1, 0)
            .await
            .unwrap();
        bump_tx(&mut tx, SCOPE_PROCEDURE, "group.promote", 1, 1)
            .await
            .unwrap();
        bump_tx(&mut tx, SCOPE_GROUP, "g1", 1, 0).await.unwrap();
        tx.commit().await.unwrap();

        let procs = store.procedure_stats("group").await.unwrap();
        assert_eq!(
            procs,
            vec![StatRow {
                key: "group.promote".into(),
                call_count: 2,
                call_abort: 1,
            }]
        );

        let groups = store.group_stats("").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "g1");

        // Patterns are prefixes.
        assert!(store.procedure_stats("nomatch").await.unwrap().is_empty());
    }
}
