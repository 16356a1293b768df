//! CRUD operations for [`User`] records and their discoverable tags.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use courier_shared::Uid;

use crate::backend::{AttrPath, Patch, Precondition, UpdateAction, WriteRequest};
use crate::error::{Result, StoreError};
use crate::fanout;
use crate::item::{
    access_attr, opt_json_attr, opt_time_attr, put_header, read_access, read_header, AttrValue,
    Item, ItemExt,
};
use crate::models::{DeviceDef, User};
use crate::pager::FailurePolicy;
use crate::schema::*;
use crate::store::Store;

impl Store {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register the user's tags, then insert the user row.
    ///
    /// Fails with [`StoreError::Conflict`] if any tag is already owned or
    /// the user id is taken. Tags registered before the conflict are left in
    /// place.
    pub async fn create_user(&self, user: &User) -> Result<()> {
        let uid = user.header.id.clone();
        for tag in &user.tags {
            self.claim_tag(tag, &uid)
                .await
                .map_err(|e| {
                    if e.is_conflict() {
                        tracing::debug!(%tag, %uid, "tag already taken");
                    }
                    e
                })?;
        }

        self.put(Table::Users, user_to_item(user), Precondition::MustNotExist)
            .await?;
        tracing::debug!(%uid, tags = user.tags.len(), "user created");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub async fn get_user(&self, uid: Uid) -> Result<Option<User>> {
        self.get_one(Table::Users, &user_key(uid))
            .await?
            .map(|item| item_to_user(&item))
            .transpose()
    }

    /// Fetch several users at once. Unknown ids are skipped; the order of
    /// the result is unspecified.
    pub async fn get_users(&self, uids: &[Uid]) -> Result<Vec<User>> {
        let keys = uids.iter().map(|uid| user_key(*uid)).collect();
        self.get_many(Table::Users, keys, None, FailurePolicy::Abort)
            .await?
            .iter()
            .map(item_to_user)
            .collect()
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub async fn update_user_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.update(
            Table::Users,
            &user_key(uid),
            vec![
                UpdateAction::Set(AttrPath::attr(ATTR_LAST_SEEN), AttrValue::time(when)),
                UpdateAction::Set(AttrPath::attr(ATTR_USER_AGENT), AttrValue::from(user_agent)),
            ],
            Precondition::MustExist,
        )
        .await
        .map_err(|e| missing_user(e, uid))
    }

    /// Apply a partial update. Field names are stored verbatim. Fails with
    /// [`StoreError::NotFound`] if the user does not exist.
    ///
    /// A `Tags` field is diffed against the stored tags: added tags are
    /// claimed first and fail with [`StoreError::Conflict`] if another user
    /// owns them, removed tags are released after the row is written.
    pub async fn update_user(&self, uid: Uid, patch: Patch) -> Result<()> {
        let Some(tags) = patch.get(ATTR_TAGS) else {
            return self.update_user_row(uid, patch).await;
        };
        let wanted = tag_list(tags)?;

        let current = self
            .get_one(Table::Users, &user_key(uid))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {uid}")))?
            .string_list(ATTR_TAGS);
        let added: Vec<&String> = wanted.iter().filter(|t| !current.contains(t)).collect();
        let removed: Vec<&String> = current.iter().filter(|t| !wanted.contains(t)).collect();

        let owner = uid.to_string();
        let mut claimed = Vec::with_capacity(added.len());
        for tag in added {
            if let Err(e) = self.claim_tag(tag, &owner).await {
                if e.is_conflict() {
                    tracing::debug!(%tag, %uid, "tag already taken");
                }
                self.release_tags(&claimed).await;
                return Err(e);
            }
            claimed.push(tag);
        }

        if let Err(e) = self.update_user_row(uid, patch).await {
            self.release_tags(&claimed).await;
            return Err(e);
        }

        for tag in &removed {
            self.remove(Table::TagUnique, &tag_key(tag), Precondition::None)
                .await?;
        }
        tracing::debug!(%uid, added = claimed.len(), removed = removed.len(), "user tags updated");
        Ok(())
    }

    async fn update_user_row(&self, uid: Uid, patch: Patch) -> Result<()> {
        self.update(
            Table::Users,
            &user_key(uid),
            patch.into_actions(),
            Precondition::MustExist,
        )
        .await
        .map_err(|e| missing_user(e, uid))
    }

    async fn claim_tag(&self, tag: &str, owner: &str) -> Result<()> {
        let record = Item::from([
            (ATTR_ID.to_string(), AttrValue::from(tag)),
            (ATTR_SOURCE.to_string(), AttrValue::from(owner)),
        ]);
        self.put(Table::TagUnique, record, Precondition::MustNotExist)
            .await
    }

    /// Undo claims made by a failed update. Failures are only logged.
    async fn release_tags(&self, tags: &[&String]) {
        for tag in tags {
            if let Err(e) = self
                .remove(Table::TagUnique, &tag_key(tag), Precondition::None)
                .await
            {
                tracing::warn!(%tag, error = %e, "failed to release tag");
            }
        }
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Soft delete timestamps the row and fails with
    /// [`StoreError::NotFound`] for an unknown user. Hard delete removes it
    /// together with the tags it owns.
    pub async fn delete_user(&self, uid: Uid, soft: bool) -> Result<()> {
        let key = user_key(uid);
        if soft {
            let now = self.now();
            return self
                .update(
                    Table::Users,
                    &key,
                    vec![
                        UpdateAction::Set(AttrPath::attr(ATTR_DELETED_AT), AttrValue::time(now)),
                        UpdateAction::Set(AttrPath::attr(ATTR_UPDATED_AT), AttrValue::time(now)),
                    ],
                    Precondition::MustExist,
                )
                .await
                .map_err(|e| missing_user(e, uid));
        }

        self.remove(Table::Users, &key, Precondition::None).await?;

        let request = self
            .query(Table::TagUnique, ATTR_SOURCE, uid.to_string())
            .index(INDEX_TAG_SOURCE)
            .project(&[ATTR_ID]);
        let tags = self.query_all(request, None, FailurePolicy::Abort).await?;
        let released = fanout::batch_write_all(
            self.backend(),
            self.table(Table::TagUnique),
            tags.into_iter().map(WriteRequest::Delete).collect(),
            self.parallelism(),
        )
        .await?;
        tracing::debug!(%uid, released, "user deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn missing_user(e: StoreError, uid: Uid) -> StoreError {
    match e {
        StoreError::Conflict { .. } => StoreError::NotFound(format!("user {uid}")),
        other => other,
    }
}

/// Tags carried by a patch value: a list or set of strings, or null.
fn tag_list(value: &AttrValue) -> Result<Vec<String>> {
    let mut tags: Vec<String> = match value {
        AttrValue::Null => Vec::new(),
        AttrValue::Ss(set) => set.clone(),
        AttrValue::L(list) => list
            .iter()
            .map(|v| {
                v.as_s()
                    .map(str::to_string)
                    .ok_or_else(|| StoreError::InvalidInput("tags must be strings".into()))
            })
            .collect::<Result<_>>()?,
        _ => return Err(StoreError::InvalidInput("tags must be a list".into())),
    };
    tags.sort_unstable();
    tags.dedup();
    Ok(tags)
}

pub(crate) fn user_to_item(user: &User) -> Item {
    let mut item = Item::new();
    put_header(&mut item, &user.header);
    item.insert(ATTR_ACCESS.to_string(), access_attr(&user.access));
    item.insert(ATTR_PUBLIC.to_string(), opt_json_attr(user.public.as_ref()));
    item.insert(ATTR_PRIVATE.to_string(), opt_json_attr(user.private.as_ref()));
    item.insert(
        ATTR_TAGS.to_string(),
        AttrValue::L(user.tags.iter().map(|t| AttrValue::from(t.as_str())).collect()),
    );
    item.insert(
        ATTR_DEVICES.to_string(),
        AttrValue::M(
            user.devices
                .iter()
                .map(|(hash, dev)| (hash.clone(), device_to_attr(dev)))
                .collect(),
        ),
    );
    item.insert(ATTR_LAST_SEEN.to_string(), opt_time_attr(user.last_seen));
    item.insert(ATTR_USER_AGENT.to_string(), AttrValue::from(user.user_agent.as_str()));
    item.insert(ATTR_SEQ_ID.to_string(), AttrValue::int(user.seq_id));
    item.insert(ATTR_CLEAR_ID.to_string(), AttrValue::int(user.clear_id));
    item
}

pub(crate) fn item_to_user(item: &Item) -> Result<User> {
    Ok(User {
        header: read_header(item)?,
        access: read_access(item)?,
        public: item.opt_json(ATTR_PUBLIC),
        private: item.opt_json(ATTR_PRIVATE),
        tags: item.string_list(ATTR_TAGS),
        devices: read_devices(item)?,
        last_seen: item.opt_time(ATTR_LAST_SEEN)?,
        user_agent: item.opt_s(ATTR_USER_AGENT).unwrap_or_default(),
        seq_id: item.int_or_zero(ATTR_SEQ_ID),
        clear_id: item.int_or_zero(ATTR_CLEAR_ID),
    })
}

pub(crate) fn device_to_attr(dev: &DeviceDef) -> AttrValue {
    AttrValue::M(BTreeMap::from([
        (ATTR_DEVICE_ID.to_string(), AttrValue::from(dev.device_id.as_str())),
        (ATTR_PLATFORM.to_string(), AttrValue::from(dev.platform.as_str())),
        (ATTR_LAST_SEEN.to_string(), opt_time_attr(dev.last_seen)),
        (ATTR_LANG.to_string(), AttrValue::from(dev.lang.as_str())),
    ]))
}

/// Decode the `Devices` map. Null entries are dropped.
pub(crate) fn read_devices(item: &Item) -> Result<BTreeMap<String, DeviceDef>> {
    let Some(AttrValue::M(map)) = item.get(ATTR_DEVICES) else {
        return Ok(BTreeMap::new());
    };
    let mut devices = BTreeMap::new();
    for (hash, value) in map {
        if let AttrValue::M(fields) = value {
            devices.insert(
                hash.clone(),
                DeviceDef {
                    device_id: fields.opt_s(ATTR_DEVICE_ID).unwrap_or_default(),
                    platform: fields.opt_s(ATTR_PLATFORM).unwrap_or_default(),
                    last_seen: fields.opt_time(ATTR_LAST_SEEN)?,
                    lang: fields.opt_s(ATTR_LANG).unwrap_or_default(),
                },
            );
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{fixed_now, test_store};
    use courier_shared::{AccessMode, DefaultAccess};
    use serde_json::json;

    fn user(id: u64, tags: &[&str]) -> User {
        let mut u = User::new(Uid(id), fixed_now());
        u.tags = tags.iter().map(|t| t.to_string()).collect();
        u.public = Some(json!({"fn": format!("user {id}")}));
        u.access = DefaultAccess {
            auth: AccessMode::P2P,
            anon: AccessMode::NONE,
        };
        u
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let (store, _) = test_store().await;
        let alice = user(100, &["email:alice@example.com"]);
        store.create_user(&alice).await.unwrap();

        let fetched = store.get_user(Uid(100)).await.unwrap().unwrap();
        assert_eq!(fetched, alice);
        assert!(store.get_user(Uid(101)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tag_uniqueness() {
        let (store, _) = test_store().await;
        store
            .create_user(&user(100, &["tel:+15550001"]))
            .await
            .unwrap();

        let err = store
            .create_user(&user(200, &["tel:+15550001"]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get_user(Uid(200)).await.unwrap().is_none());

        // The original owner is untouched.
        let found = store.find_subs(Uid(300), &["tel:+15550001"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user, Uid(100).to_string());
    }

    #[tokio::test]
    async fn test_duplicate_user_id() {
        let (store, _) = test_store().await;
        store.create_user(&user(100, &[])).await.unwrap();
        assert!(store
            .create_user(&user(100, &[]))
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_get_users_across_chunks() {
        let (store, _) = test_store().await;
        let uids: Vec<Uid> = (1000..1250).map(Uid).collect();
        for uid in &uids {
            store.create_user(&user(uid.0, &[])).await.unwrap();
        }
        let mut wanted = uids.clone();
        wanted.push(Uid(99_999));
        let users = store.get_users(&wanted).await.unwrap();
        assert_eq!(users.len(), 250);
    }

    #[tokio::test]
    async fn test_soft_and_hard_delete() {
        let (store, _) = test_store().await;
        store.create_user(&user(100, &["nick:al"])).await.unwrap();

        store.delete_user(Uid(100), true).await.unwrap();
        let soft = store.get_user(Uid(100)).await.unwrap().unwrap();
        assert_eq!(soft.header.deleted_at, Some(fixed_now()));

        store.delete_user(Uid(100), false).await.unwrap();
        assert!(store.get_user(Uid(100)).await.unwrap().is_none());

        // Released tags can be claimed again.
        store.create_user(&user(200, &["nick:al"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_tags_keeps_them_unique() {
        let (store, backend) = test_store().await;
        store.create_user(&user(100, &["tel:1"])).await.unwrap();
        store.create_user(&user(200, &["nick:bo"])).await.unwrap();

        let taken = Patch::new().set(ATTR_TAGS, json!(["nick:bo", "tel:0", "tel:1"]));
        let err = store.update_user(Uid(200), taken).await.unwrap_err();
        assert!(err.is_conflict());
        let bo = store.get_user(Uid(200)).await.unwrap().unwrap();
        assert_eq!(bo.tags, vec!["nick:bo".to_string()]);
        // Claims made before the conflict are rolled back.
        let tags = store.table(Table::TagUnique).to_string();
        assert_eq!(backend.row_count(&tags).await, 2);

        let swap = Patch::new().set(ATTR_TAGS, json!(["tel:2"]));
        store.update_user(Uid(200), swap).await.unwrap();
        let bo = store.get_user(Uid(200)).await.unwrap().unwrap();
        assert_eq!(bo.tags, vec!["tel:2".to_string()]);
        assert_eq!(backend.row_count(&tags).await, 2);

        // The released tag can be claimed by someone else.
        store.create_user(&user(300, &["nick:bo"])).await.unwrap();
        let found = store.find_subs(Uid(1), &["tel:2", "tel:1"]).await.unwrap();
        assert_eq!(found.len(), 2);

        let missing = store
            .update_user(Uid(999), Patch::new().set(ATTR_TAGS, json!(["nick:zz"])))
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
        assert_eq!(backend.row_count(&tags).await, 3);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_materialised() {
        let (store, _) = test_store().await;
        let soft = store.delete_user(Uid(42), true).await;
        assert!(matches!(soft, Err(StoreError::NotFound(_))));
        let seen = store
            .update_user_last_seen(Uid(43), "courier/1.0", fixed_now())
            .await;
        assert!(matches!(seen, Err(StoreError::NotFound(_))));

        assert!(store.get_user(Uid(42)).await.unwrap().is_none());
        assert!(store.get_user(Uid(43)).await.unwrap().is_none());
        store.create_user(&user(42, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_user() {
        let (store, _) = test_store().await;
        store.create_user(&user(100, &[])).await.unwrap();

        let when = fixed_now() + chrono::Duration::minutes(5);
        store
            .update_user_last_seen(Uid(100), "courier/1.0", when)
            .await
            .unwrap();

        let patch = Patch::new()
            .set(ATTR_PUBLIC, json!({"fn": "Alice"}))
            .set("Custom", "kept verbatim");
        store.update_user(Uid(100), patch).await.unwrap();

        let fetched = store.get_user(Uid(100)).await.unwrap().unwrap();
        assert_eq!(fetched.last_seen, Some(when));
        assert_eq!(fetched.user_agent, "courier/1.0");
        assert_eq!(fetched.public, Some(json!({"fn": "Alice"})));

        let raw = store
            .get_one(Table::Users, &user_key(Uid(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.opt_s("Custom").as_deref(), Some("kept verbatim"));

        let missing = store.update_user(Uid(5555), Patch::new().set("X", 1i64)).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
