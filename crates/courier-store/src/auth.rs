//! Credential records, keyed by their scheme-qualified unique id.

use chrono::{DateTime, Utc};

use courier_shared::Uid;

use crate::backend::{AttrPath, Precondition, UpdateAction, WriteRequest};
use crate::conditional::absorb_conflict;
use crate::error::{Result, StoreError};
use crate::fanout;
use crate::item::{opt_time_attr, AttrValue, Item, ItemExt};
use crate::models::AuthRecord;
use crate::pager::FailurePolicy;
use crate::schema::{
    auth_key, Table, ATTR_AUTH_LVL, ATTR_EXPIRES, ATTR_SECRET, ATTR_UNIQUE, ATTR_USER_ID,
    INDEX_AUTH_USER_ID,
};
use crate::store::Store;

impl Store {
    pub async fn get_auth_record(&self, unique: &str) -> Result<Option<AuthRecord>> {
        self.get_one(Table::Auth, &auth_key(unique))
            .await?
            .map(|item| item_to_auth(&item))
            .transpose()
    }

    /// Fails with [`StoreError::Conflict`] if `unique` is already registered.
    pub async fn add_auth_record(&self, record: &AuthRecord) -> Result<()> {
        self.put(Table::Auth, auth_to_item(record), Precondition::MustNotExist)
            .await
    }

    /// Replace level, secret and expiry of an existing record. Returns the
    /// number of records changed.
    pub async fn update_auth_record(
        &self,
        unique: &str,
        auth_level: i64,
        secret: &[u8],
        expires: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let changed = absorb_conflict(
            self.update(
                Table::Auth,
                &auth_key(unique),
                vec![
                    UpdateAction::Set(AttrPath::attr(ATTR_AUTH_LVL), AttrValue::int(auth_level)),
                    UpdateAction::Set(AttrPath::attr(ATTR_SECRET), AttrValue::B(secret.to_vec())),
                    UpdateAction::Set(AttrPath::attr(ATTR_EXPIRES), opt_time_attr(expires)),
                ],
                Precondition::MustExist,
            )
            .await,
        )?;
        Ok(usize::from(changed))
    }

    /// Returns the number of records removed.
    pub async fn delete_auth_record(&self, unique: &str) -> Result<usize> {
        let removed = absorb_conflict(
            self.remove(Table::Auth, &auth_key(unique), Precondition::MustExist)
                .await,
        )?;
        Ok(usize::from(removed))
    }

    /// Revoke every credential owned by `uid`. Returns the number removed.
    pub async fn delete_all_auth_records(&self, uid: Uid) -> Result<usize> {
        let request = self
            .query(Table::Auth, ATTR_USER_ID, uid.to_string())
            .index(INDEX_AUTH_USER_ID)
            .project(&[ATTR_UNIQUE]);
        let keys = self.query_all(request, None, FailurePolicy::Abort).await?;

        let removed = fanout::batch_write_all(
            self.backend(),
            self.table(Table::Auth),
            keys.into_iter().map(WriteRequest::Delete).collect(),
            self.parallelism(),
        )
        .await?;
        tracing::debug!(%uid, removed, "auth records revoked");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn auth_to_item(record: &AuthRecord) -> Item {
    Item::from([
        (ATTR_UNIQUE.to_string(), AttrValue::from(record.unique.as_str())),
        (ATTR_USER_ID.to_string(), AttrValue::from(record.user.to_string())),
        (ATTR_AUTH_LVL.to_string(), AttrValue::int(record.auth_level)),
        (ATTR_SECRET.to_string(), AttrValue::B(record.secret.clone())),
        (ATTR_EXPIRES.to_string(), opt_time_attr(record.expires)),
    ])
}

fn item_to_auth(item: &Item) -> Result<AuthRecord> {
    let secret = match item.get(ATTR_SECRET) {
        Some(AttrValue::B(bytes)) => bytes.clone(),
        None | Some(AttrValue::Null) => Vec::new(),
        Some(other) => {
            return Err(StoreError::codec(format!("secret is not binary: {other:?}")));
        }
    };
    Ok(AuthRecord {
        unique: item.req_s(ATTR_UNIQUE)?,
        user: Uid::parse(&item.req_s(ATTR_USER_ID)?)?,
        auth_level: item.int_or_zero(ATTR_AUTH_LVL),
        secret,
        expires: item.opt_time(ATTR_EXPIRES)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{fixed_now, test_store};

    fn record(unique: &str, uid: Uid) -> AuthRecord {
        AuthRecord {
            unique: unique.to_string(),
            user: uid,
            auth_level: 1,
            secret: b"x".to_vec(),
            expires: Some(fixed_now() + chrono::Duration::days(30)),
        }
    }

    #[tokio::test]
    async fn test_credential_round_trip() {
        let (store, _) = test_store().await;
        let rec = record("basic:alice", Uid(77));
        store.add_auth_record(&rec).await.unwrap();

        let fetched = store.get_auth_record("basic:alice").await.unwrap().unwrap();
        assert_eq!(fetched.user, Uid(77));
        assert_eq!(fetched.auth_level, 1);
        assert_eq!(fetched.secret, b"x".to_vec());
        assert_eq!(fetched.expires, rec.expires);

        assert!(store.get_auth_record("basic:bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_credential() {
        let (store, _) = test_store().await;
        store.add_auth_record(&record("basic:alice", Uid(1))).await.unwrap();
        let err = store
            .add_auth_record(&record("basic:alice", Uid(2)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let kept = store.get_auth_record("basic:alice").await.unwrap().unwrap();
        assert_eq!(kept.user, Uid(1));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (store, _) = test_store().await;
        store.add_auth_record(&record("basic:alice", Uid(1))).await.unwrap();

        assert_eq!(
            store
                .update_auth_record("basic:alice", 20, b"new", None)
                .await
                .unwrap(),
            1
        );
        let fetched = store.get_auth_record("basic:alice").await.unwrap().unwrap();
        assert_eq!(fetched.auth_level, 20);
        assert_eq!(fetched.secret, b"new".to_vec());
        assert_eq!(fetched.expires, None);

        assert_eq!(
            store.update_auth_record("basic:nobody", 1, b"", None).await.unwrap(),
            0
        );
        assert_eq!(store.delete_auth_record("basic:alice").await.unwrap(), 1);
        assert_eq!(store.delete_auth_record("basic:alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_all_beyond_one_batch() {
        let (store, _) = test_store().await;
        let uid = Uid(9);
        for i in 0..40 {
            store
                .add_auth_record(&record(&format!("token:{i}"), uid))
                .await
                .unwrap();
        }
        store.add_auth_record(&record("basic:other", Uid(10))).await.unwrap();

        assert_eq!(store.delete_all_auth_records(uid).await.unwrap(), 40);
        assert!(store.get_auth_record("token:0").await.unwrap().is_none());
        assert!(store.get_auth_record("basic:other").await.unwrap().is_some());
    }
}
