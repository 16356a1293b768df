//! Schema bootstrap.

use serde_json::json;

use courier_shared::{AccessMode, DefaultAccess};

use crate::backend::Precondition;
use crate::conditional::absorb_conflict;
use crate::error::Result;
use crate::models::User;
use crate::schema::{Table, ATTR_EXPIRE_TIME};
use crate::store::Store;

impl Store {
    /// Create the six tables, enable message expiry and install the
    /// self-talk service account. Safe to run against an initialised
    /// backend; with `reset` every table is dropped first.
    pub async fn create_db(&self, reset: bool) -> Result<()> {
        if reset {
            for table in Table::ALL {
                let name = self.table(table);
                if self.backend().delete_table(name).await? {
                    tracing::info!(table = %name, "table deleted");
                }
            }
        }

        for table in Table::ALL {
            let schema = self.schema(table);
            if self.backend().create_table(schema).await? {
                tracing::info!(table = %schema.name, "table created");
            } else {
                tracing::debug!(table = %schema.name, "table already exists");
            }
        }

        self.backend()
            .enable_ttl(self.table(Table::Messages), ATTR_EXPIRE_TIME)
            .await?;

        let mut service = User::new(self.self_talk_uid(), self.now());
        service.access = DefaultAccess {
            auth: AccessMode::P2P,
            anon: AccessMode::NONE,
        };
        service.public = Some(json!({"fn": "SelfTalkService"}));

        let item = crate::users::user_to_item(&service);
        if absorb_conflict(self.put(Table::Users, item, Precondition::MustNotExist).await)? {
            tracing::info!(uid = %service.header.id, "self-talk service account installed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::test_store;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let (store, backend) = test_store().await;
        store.create_db(false).await.unwrap();

        let service = store.get_user(store.self_talk_uid()).await.unwrap().unwrap();
        assert_eq!(service.public, Some(json!({"fn": "SelfTalkService"})));
        assert_eq!(service.access.auth, AccessMode::P2P);
        assert_eq!(service.access.anon, AccessMode::NONE);
        assert_eq!(
            backend.ttl_attr(store.table(Table::Messages)).await.as_deref(),
            Some(ATTR_EXPIRE_TIME)
        );
    }

    #[tokio::test]
    async fn test_reset_drops_rows() {
        let (store, backend) = test_store().await;
        let topic = crate::models::Topic::new("grpA", store.now());
        store.create_topic(&topic).await.unwrap();
        assert_eq!(backend.row_count(store.table(Table::Topics)).await, 1);

        store.create_db(true).await.unwrap();
        assert_eq!(backend.row_count(store.table(Table::Topics)).await, 0);
        assert!(store.get_user(store.self_talk_uid()).await.unwrap().is_some());
    }
}
