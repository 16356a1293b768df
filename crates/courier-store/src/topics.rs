//! CRUD operations for [`Topic`] records.

use courier_shared::{TopicCat, Uid};

use crate::backend::{AttrPath, Patch, Precondition, UpdateAction, WriteRequest};
use crate::conditional::absorb_conflict;
use crate::error::{Result, StoreError};
use crate::fanout;
use crate::item::{
    access_attr, opt_json_attr, put_header, read_access, read_header, AttrValue, Item, ItemExt,
};
use crate::models::{Subscription, Topic};
use crate::schema::{
    topic_key, user_key, Table, ATTR_ACCESS, ATTR_CLEAR_ID, ATTR_PUBLIC, ATTR_SEQ_ID,
};
use crate::store::Store;
use crate::subscriptions::sub_to_item;

impl Store {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert or replace a topic row.
    pub async fn create_topic(&self, topic: &Topic) -> Result<()> {
        self.put(Table::Topics, topic_to_item(topic), Precondition::None)
            .await
    }

    /// Seed a one-to-one topic.
    ///
    /// The initiator's subscription is always written. The invited party's
    /// subscription is only created if absent, so repeating the call never
    /// overwrites it. The topic row is likewise created once, with its
    /// timestamps taken from the initiator's subscription. Every step is
    /// idempotent, so a caller recovers from a partial failure by retrying.
    pub async fn create_p2p_topic(
        &self,
        initiator: &Subscription,
        invited: &Subscription,
    ) -> Result<()> {
        if TopicCat::of(&initiator.topic) != TopicCat::P2P || invited.topic != initiator.topic {
            return Err(StoreError::InvalidInput(format!(
                "not a one-to-one seeding: {} / {}",
                initiator.topic, invited.topic
            )));
        }

        self.put(Table::Subscriptions, sub_to_item(initiator), Precondition::None)
            .await?;

        let created = absorb_conflict(
            self.put(
                Table::Subscriptions,
                sub_to_item(invited),
                Precondition::MustNotExist,
            )
            .await,
        )?;
        if !created {
            tracing::debug!(topic = %invited.topic, user = %invited.user, "invited subscription kept");
        }

        let mut topic = Topic {
            header: courier_shared::ObjHeader {
                id: initiator.topic.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        topic.header.merge_times(&initiator.header);
        topic.header.deleted_at = None;
        absorb_conflict(
            self.put(Table::Topics, topic_to_item(&topic), Precondition::MustNotExist)
                .await,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        self.get_one(Table::Topics, &topic_key(name))
            .await?
            .map(|item| item_to_topic(&item))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub async fn update_topic(&self, name: &str, patch: Patch) -> Result<()> {
        self.update(
            Table::Topics,
            &topic_key(name),
            patch.into_actions(),
            Precondition::None,
        )
        .await
    }

    /// Record the newest sequence id after a message was saved. Self
    /// channels keep it on the owner's user row.
    pub async fn update_topic_on_message(&self, name: &str, seq_id: i64) -> Result<()> {
        let (table, key) = match TopicCat::of(name) {
            TopicCat::Me => (Table::Users, user_key(Uid::parse_user_id(name)?)),
            _ => (Table::Topics, topic_key(name)),
        };
        self.update(
            table,
            &key,
            vec![UpdateAction::Set(
                AttrPath::attr(ATTR_SEQ_ID),
                AttrValue::int(seq_id),
            )],
            Precondition::None,
        )
        .await
    }

    /// Bulk insert or replace subscription rows. Returns the number written.
    pub async fn share_topic(&self, subs: &[Subscription]) -> Result<usize> {
        let requests = subs
            .iter()
            .map(|sub| WriteRequest::Put(sub_to_item(sub)))
            .collect();
        fanout::batch_write_all(
            self.backend(),
            self.table(Table::Subscriptions),
            requests,
            self.parallelism(),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        self.remove(Table::Topics, &topic_key(name), Precondition::None)
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn topic_to_item(topic: &Topic) -> Item {
    let mut item = Item::new();
    put_header(&mut item, &topic.header);
    item.insert(ATTR_ACCESS.to_string(), access_attr(&topic.access));
    item.insert(ATTR_SEQ_ID.to_string(), AttrValue::int(topic.seq_id));
    item.insert(ATTR_CLEAR_ID.to_string(), AttrValue::int(topic.clear_id));
    item.insert(ATTR_PUBLIC.to_string(), opt_json_attr(topic.public.as_ref()));
    item
}

pub(crate) fn item_to_topic(item: &Item) -> Result<Topic> {
    Ok(Topic {
        header: read_header(item)?,
        access: read_access(item)?,
        seq_id: item.int_or_zero(ATTR_SEQ_ID),
        clear_id: item.int_or_zero(ATTR_CLEAR_ID),
        public: item.opt_json(ATTR_PUBLIC),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::pager::FailurePolicy;
    use crate::schema::{subscription_key, ATTR_TOPIC, INDEX_SUBS_TOPIC};
    use crate::store::test_support::{fixed_now, test_store};
    use courier_shared::AccessMode;
    use serde_json::json;

    fn p2p_pair(a: Uid, b: Uid, note: &str) -> (Subscription, Subscription) {
        let topic = a.p2p_name(b).unwrap();
        let mut initiator = Subscription::new(&topic, a, fixed_now());
        initiator.mode_want = AccessMode::P2P;
        initiator.mode_given = AccessMode::P2P;
        let mut invited = Subscription::new(&topic, b, fixed_now());
        invited.private = Some(json!({"note": note}));
        (initiator, invited)
    }

    #[tokio::test]
    async fn test_topic_crud() {
        let (store, _) = test_store().await;
        let mut topic = Topic::new("grpChat", fixed_now());
        topic.public = Some(json!({"fn": "Chat"}));
        store.create_topic(&topic).await.unwrap();
        assert_eq!(store.get_topic("grpChat").await.unwrap().unwrap(), topic);

        store
            .update_topic("grpChat", Patch::new().set(ATTR_PUBLIC, json!({"fn": "Renamed"})))
            .await
            .unwrap();
        store.update_topic_on_message("grpChat", 42).await.unwrap();
        let updated = store.get_topic("grpChat").await.unwrap().unwrap();
        assert_eq!(updated.public, Some(json!({"fn": "Renamed"})));
        assert_eq!(updated.seq_id, 42);

        store.delete_topic("grpChat").await.unwrap();
        assert!(store.get_topic("grpChat").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_topic_seq_id_lives_on_user() {
        let (store, _) = test_store().await;
        let uid = Uid(700);
        store.create_user(&User::new(uid, fixed_now())).await.unwrap();
        store.update_topic_on_message(&uid.user_id(), 9).await.unwrap();
        assert_eq!(store.get_user(uid).await.unwrap().unwrap().seq_id, 9);
        assert!(store.get_topic(&uid.user_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_p2p_seeding_is_idempotent() {
        let (store, _) = test_store().await;
        let (a, b) = (Uid(10), Uid(20));

        let (initiator, invited) = p2p_pair(a, b, "first");
        store.create_p2p_topic(&initiator, &invited).await.unwrap();
        store.update_topic_on_message(&initiator.topic, 5).await.unwrap();

        let (initiator2, invited2) = p2p_pair(a, b, "second");
        store.create_p2p_topic(&initiator2, &invited2).await.unwrap();

        let request = store
            .query(Table::Subscriptions, ATTR_TOPIC, initiator.topic.clone())
            .index(INDEX_SUBS_TOPIC);
        let rows = store
            .query_all(request, None, FailurePolicy::Abort)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let kept = store.get_subscription(&initiator.topic, b).await.unwrap().unwrap();
        assert_eq!(kept.private, Some(json!({"note": "first"})));

        // A retry never resets the topic's sequence id.
        let topic = store.get_topic(&initiator.topic).await.unwrap().unwrap();
        assert_eq!(topic.seq_id, 5);
        assert_eq!(topic.header.created_at, fixed_now());

        assert!(store
            .get_one(Table::Subscriptions, &subscription_key(&initiator.topic, a))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_p2p_rejects_group_topic() {
        let (store, _) = test_store().await;
        let a = Subscription::new("grpX", Uid(1), fixed_now());
        let b = Subscription::new("grpX", Uid(2), fixed_now());
        assert!(matches!(
            store.create_p2p_topic(&a, &b).await,
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_share_topic_beyond_one_batch() {
        let (store, _) = test_store().await;
        let subs: Vec<Subscription> = (1..=60)
            .map(|i| Subscription::new("grpBig", Uid(i), fixed_now()))
            .collect();
        assert_eq!(store.share_topic(&subs).await.unwrap(), 60);
        let members = store.subs_for_topic("grpBig", false).await.unwrap();
        assert_eq!(members.len(), 60);
    }
}
