//! Single-item writes guarded by an existence precondition.
//!
//! A failed precondition comes back as [`StoreError::Conflict`], never as a
//! backend failure, so callers can map it to "already exists" or "already
//! gone".

use crate::backend::{Precondition, UpdateAction};
use crate::error::{Result, StoreError};
use crate::item::Item;
use crate::schema::Table;
use crate::store::Store;

/// Turn a conflict into `Ok(false)`; pass every other outcome through.
pub fn absorb_conflict(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(StoreError::Conflict { table, key }) => {
            tracing::debug!(%table, %key, "precondition failed, treating as no-op");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

impl Store {
    pub(crate) async fn put(&self, table: Table, item: Item, cond: Precondition) -> Result<()> {
        self.backend().put_item(self.table(table), item, cond).await
    }

    pub(crate) async fn update(
        &self,
        table: Table,
        key: &Item,
        actions: Vec<UpdateAction>,
        cond: Precondition,
    ) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        self.backend()
            .update_item(self.table(table), key, actions, cond)
            .await
    }

    pub(crate) async fn remove(&self, table: Table, key: &Item, cond: Precondition) -> Result<()> {
        self.backend().delete_item(self.table(table), key, cond).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttrPath;
    use crate::item::AttrValue;
    use crate::schema;
    use crate::store::test_support::test_store;

    #[tokio::test]
    async fn test_conflict_is_distinguishable() {
        let (store, backend) = test_store().await;
        let key = schema::topic_key("grp1");

        store
            .put(Table::Topics, key.clone(), Precondition::MustNotExist)
            .await
            .unwrap();
        let again = store
            .put(Table::Topics, key.clone(), Precondition::MustNotExist)
            .await;
        assert!(again.as_ref().unwrap_err().is_conflict());
        assert!(!absorb_conflict(again).unwrap());

        backend.fail_on("grp1").await;
        let infra = store
            .put(Table::Topics, key.clone(), Precondition::MustNotExist)
            .await;
        assert!(matches!(absorb_conflict(infra), Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_must_exist_update_on_absent_row() {
        let (store, _) = test_store().await;
        let result = store
            .update(
                Table::Topics,
                &schema::topic_key("missing"),
                vec![UpdateAction::Set(AttrPath::attr("ClearId"), AttrValue::int(3))],
                Precondition::MustExist,
            )
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert!(store
            .get_one(Table::Topics, &schema::topic_key("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
