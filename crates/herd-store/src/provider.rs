//! Cloud-provider plumbing tables.
//!
//! Providers describe where machines can be created; machines record what
//! was created. The controller only books them, it does not talk to any
//! cloud API itself.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use herd_types::Error;

use crate::{persistence_err, Store};

/// A registered machine provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    /// Operator-chosen identity.
    pub provider_id: String,
    /// Provider kind, e.g. `OPENSTACK`.
    pub kind: String,
    /// Endpoint URL.
    pub url: String,
    /// Account used against the endpoint.
    pub user: Option<String>,
    /// Password for `user`.
    pub passwd: Option<String>,
}

/// A machine booked against a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    /// Machine identity.
    pub machine_uuid: Uuid,
    /// Provider the machine was booked on.
    pub provider_id: String,
    /// Image the machine was created from.
    pub image: Option<String>,
    /// Size/flavor of the machine.
    pub flavor: Option<String>,
    /// Comma-separated addresses assigned to the machine.
    pub addresses: Option<String>,
}

fn row_to_provider(row: &SqliteRow) -> Result<Provider, Error> {
    Ok(Provider {
        provider_id: row.try_get("provider_id").map_err(persistence_err)?,
        kind: row.try_get("kind").map_err(persistence_err)?,
        url: row.try_get("url").map_err(persistence_err)?,
        user: row.try_get("user").map_err(persistence_err)?,
        passwd: row.try_get("passwd").map_err(persistence_err)?,
    })
}

fn row_to_machine(row: &SqliteRow) -> Result<Machine, Error> {
    let uuid: String = row.try_get("machine_uuid").map_err(persistence_err)?;
    Ok(Machine {
        machine_uuid: Uuid::parse_str(&uuid)
            .map_err(|e| Error::Persistence(format!("bad uuid in machines table: {e}")))?,
        provider_id: row.try_get("provider_id").map_err(persistence_err)?,
        image: row.try_get("image").map_err(persistence_err)?,
        flavor: row.try_get("flavor").map_err(persistence_err)?,
        addresses: row.try_get("addresses").map_err(persistence_err)?,
    })
}

impl Store {
    /// Register a provider; fails if the id is taken.
    pub async fn add_provider(&self, provider: &Provider) -> Result<(), Error> {
        if self.fetch_provider(&provider.provider_id).await?.is_some() {
            return Err(Error::Server(format!(
                "provider ({}) already exists",
                provider.provider_id
            )));
        }
        self.retry("add provider", || async {
            sqlx::query(
                "INSERT INTO providers (provider_id, kind, url, user, passwd) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&provider.provider_id)
            .bind(&provider.kind)
            .bind(&provider.url)
            .bind(&provider.user)
            .bind(&provider.passwd)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Fetch a provider by id.
    pub async fn fetch_provider(&self, provider_id: &str) -> Result<Option<Provider>, Error> {
        let row = self
            .retry("fetch provider", || async {
                sqlx::query("SELECT * FROM providers WHERE provider_id = ?")
                    .bind(provider_id)
                    .fetch_optional(self.pool())
                    .await
            })
            .await?;
        row.as_ref().map(row_to_provider).transpose()
    }

    /// All providers, ordered by id.
    pub async fn providers(&self) -> Result<Vec<Provider>, Error> {
        let rows = self
            .retry("list providers", || async {
                sqlx::query("SELECT * FROM providers ORDER BY provider_id")
                    .fetch_all(self.pool())
                    .await
            })
            .await?;
        rows.iter().map(row_to_provider).collect()
    }

    /// Unregister a provider with no machines booked on it.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<(), Error> {
        if !self.machines(Some(provider_id)).await?.is_empty() {
            return Err(Error::Server(format!(
                "provider ({provider_id}) still has machines"
            )));
        }
        let done = self
            .retry("remove provider", || async {
                sqlx::query("DELETE FROM providers WHERE provider_id = ?")
                    .bind(provider_id)
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Server(format!(
                "provider ({provider_id}) does not exist"
            )));
        }
        Ok(())
    }

    /// Book a machine against a registered provider.
    pub async fn add_machine(&self, machine: &Machine) -> Result<(), Error> {
        if self.fetch_provider(&machine.provider_id).await?.is_none() {
            return Err(Error::Server(format!(
                "provider ({}) does not exist",
                machine.provider_id
            )));
        }
        self.retry("add machine", || async {
            sqlx::query(
                "INSERT INTO machines (machine_uuid, provider_id, image, flavor, addresses) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(machine.machine_uuid.to_string())
            .bind(&machine.provider_id)
            .bind(&machine.image)
            .bind(&machine.flavor)
            .bind(&machine.addresses)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Machines, optionally restricted to one provider, ordered by uuid.
    pub async fn machines(&self, provider_id: Option<&str>) -> Result<Vec<Machine>, Error> {
        let rows = match provider_id {
            Some(provider_id) => {
                self.retry("list machines", || async {
                    sqlx::query(
                        "SELECT * FROM machines WHERE provider_id = ? ORDER BY machine_uuid",
                    )
                    .bind(provider_id)
                    .fetch_all(self.pool())
                    .await
                })
                .await?
            }
            None => {
                self.retry("list machines", || async {
                    sqlx::query("SELECT * FROM machines ORDER BY machine_uuid")
                        .fetch_all(self.pool())
                        .await
                })
                .await?
            }
        };
        rows.iter().map(row_to_machine).collect()
    }

    /// Destroy a booked machine.
    pub async fn remove_machine(&self, machine_uuid: Uuid) -> Result<(), Error> {
        let done = self
            .retry("remove machine", || async {
                sqlx::query("DELETE FROM machines WHERE machine_uuid = ?")
                    .bind(machine_uuid.to_string())
                    .execute(self.pool())
                    .await
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::Server(format!(
                "machine ({machine_uuid}) does not exist"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provider_machine_lifecycle() {
        let store = Store::in_memory().await.unwrap();
        let provider = Provider {
            provider_id: "east".into(),
            kind: "OPENSTACK".into(),
            url: "https://cloud.example.com".into(),
            user: Some("admin".into()),
            passwd: None,
        };
        store.add_provider(&provider).await.unwrap();
        assert!(matches!(
            store.add_provider(&provider).await,
            Err(Error::Server(_))
        ));

        let machine = Machine {
            machine_uuid: Uuid::new_v4(),
            provider_id: "east".into(),
            image: Some("db-base".into()),
            flavor: Some("m1.large".into()),
            addresses: Some("10.0.0.7".into()),
        };
        store.add_machine(&machine).await.unwrap();

        // A provider with machines cannot be unregistered.
        assert!(matches!(
            store.remove_provider("east").await,
            Err(Error::Server(_))
        ));

        store.remove_machine(machine.machine_uuid).await.unwrap();
        store.remove_provider("east").await.unwrap();
        assert!(store.providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn machines_require_a_provider() {
        let store = Store::in_memory().await.unwrap();
        let machine = Machine {
            machine_uuid: Uuid::new_v4(),
            provider_id: "nowhere".into(),
            image: None,
            flavor: None,
            addresses: None,
        };
        assert!(matches!(
            store.add_machine(&machine).await,
            Err(Error::Server(_))
        ));
    }
}
