//! Push-notification devices, kept as a map on the owning user's row.
//!
//! Map keys are hashes of the device id so every key has the same short,
//! attribute-name-safe shape.

use courier_shared::Uid;

use crate::backend::{AttrPath, Precondition, UpdateAction};
use crate::conditional::absorb_conflict;
use crate::error::{Result, StoreError};
use crate::item::ItemExt;
use crate::models::{DeviceDef, DeviceList};
use crate::pager::FailurePolicy;
use crate::schema::{device_key, user_key, Table, ATTR_DEVICES, ATTR_ID};
use crate::store::Store;
use crate::users::{device_to_attr, read_devices};

impl Store {
    /// Register or refresh a device. Fails with [`StoreError::NotFound`] if
    /// the user does not exist.
    pub async fn upsert_device(&self, uid: Uid, device: &DeviceDef) -> Result<()> {
        let hash = device_key(&device.device_id);
        self.update(
            Table::Users,
            &user_key(uid),
            vec![UpdateAction::Set(
                AttrPath::map_key(ATTR_DEVICES, hash),
                device_to_attr(device),
            )],
            Precondition::MustExist,
        )
        .await
        .map_err(|e| match e {
            StoreError::Conflict { .. } => StoreError::NotFound(format!("user {uid}")),
            other => other,
        })
    }

    /// Forget a device. Unknown users and devices are ignored.
    pub async fn delete_device(&self, uid: Uid, device_id: &str) -> Result<()> {
        absorb_conflict(
            self.update(
                Table::Users,
                &user_key(uid),
                vec![UpdateAction::Remove(AttrPath::map_key(
                    ATTR_DEVICES,
                    device_key(device_id),
                ))],
                Precondition::MustExist,
            )
            .await,
        )?;
        Ok(())
    }

    /// Devices of every listed user. Users without devices are left out.
    /// Best effort: chunks that fail to load are logged and skipped.
    pub async fn get_devices(&self, uids: &[Uid]) -> Result<DeviceList> {
        let keys = uids.iter().map(|uid| user_key(*uid)).collect();
        let projection = [ATTR_ID.to_string(), ATTR_DEVICES.to_string()];
        let rows = self
            .get_many(
                Table::Users,
                keys,
                Some(&projection[..]),
                FailurePolicy::LogAndContinue,
            )
            .await?;

        let mut list = DeviceList::default();
        for row in &rows {
            let devices = read_devices(row)?;
            if devices.is_empty() {
                continue;
            }
            let uid = match row.req_s(ATTR_ID).and_then(|id| Ok(Uid::parse(&id)?)) {
                Ok(uid) => uid,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping devices of unparseable user id");
                    continue;
                }
            };
            list.count += devices.len();
            list.devices.insert(uid, devices.into_values().collect());
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::store::test_support::{fixed_now, test_store};

    fn device(id: &str, platform: &str) -> DeviceDef {
        DeviceDef {
            device_id: id.to_string(),
            platform: platform.to_string(),
            last_seen: Some(fixed_now()),
            lang: "en-US".to_string(),
        }
    }

    #[tokio::test]
    async fn test_device_lifecycle() {
        let (store, _) = test_store().await;
        let (a, b) = (Uid(1), Uid(2));
        for uid in [a, b, Uid(3)] {
            store.create_user(&User::new(uid, fixed_now())).await.unwrap();
        }

        store.upsert_device(a, &device("tok-a1", "android")).await.unwrap();
        store.upsert_device(a, &device("tok-a2", "ios")).await.unwrap();
        store.upsert_device(b, &device("tok-b1", "web")).await.unwrap();

        // Upserting the same device id replaces the entry.
        store.upsert_device(a, &device("tok-a1", "android-12")).await.unwrap();

        let list = store.get_devices(&[a, b, Uid(3), Uid(4)]).await.unwrap();
        assert_eq!(list.count, 3);
        assert_eq!(list.devices.len(), 2);
        let mut platforms: Vec<_> = list.devices[&a].iter().map(|d| d.platform.as_str()).collect();
        platforms.sort_unstable();
        assert_eq!(platforms, vec!["android-12", "ios"]);

        let user = store.get_user(a).await.unwrap().unwrap();
        assert!(user.devices.contains_key(&device_key("tok-a1")));

        store.delete_device(a, "tok-a1").await.unwrap();
        store.delete_device(a, "tok-unknown").await.unwrap();
        store.delete_device(Uid(99), "tok-a1").await.unwrap();

        let list = store.get_devices(&[a, b]).await.unwrap();
        assert_eq!(list.count, 2);
        assert_eq!(list.devices[&a], vec![device("tok-a2", "ios")]);
    }

    #[tokio::test]
    async fn test_upsert_for_missing_user() {
        let (store, _) = test_store().await;
        assert!(matches!(
            store.upsert_device(Uid(42), &device("tok", "web")).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get_user(Uid(42)).await.unwrap().is_none());
    }
}
