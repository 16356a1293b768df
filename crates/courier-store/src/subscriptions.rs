//! Subscriptions: the join table between users and topics.
//!
//! Read paths that return subscriptions enrich them in memory with fields
//! from the referenced topic and user rows. The stored rows are never
//! rewritten by a read.

use std::collections::HashMap;

use courier_shared::{AccessMode, TopicCat, Uid};

use crate::backend::{AttrPath, Filter, Patch, Precondition, QueryRequest, UpdateAction};
use crate::conditional::absorb_conflict;
use crate::error::{Result, StoreError};
use crate::fanout::fan_out;
use crate::item::{opt_json_attr, put_header, read_header, AttrValue, Item, ItemExt};
use crate::models::Subscription;
use crate::pager::FailurePolicy;
use crate::schema::*;
use crate::store::Store;
use crate::topics::item_to_topic;
use crate::users::item_to_user;

impl Store {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub async fn get_subscription(&self, topic: &str, user: Uid) -> Result<Option<Subscription>> {
        self.get_one(Table::Subscriptions, &subscription_key(topic, user))
            .await?
            .map(|item| item_to_sub(&item))
            .transpose()
    }

    /// All subscriptions of `uid`, without enrichment. Rejects the zero uid.
    pub async fn subs_for_user(&self, uid: Uid, keep_deleted: bool) -> Result<Vec<Subscription>> {
        if uid.is_zero() {
            return Err(StoreError::InvalidInput(
                "subscriptions requested for the zero user".to_string(),
            ));
        }
        let request = self.by_user(uid, keep_deleted, Vec::new());
        self.query_all(request, None, FailurePolicy::Abort)
            .await?
            .iter()
            .map(item_to_sub)
            .collect()
    }

    /// Subscriptions of `uid` to real topics, enriched with topic state and,
    /// for one-to-one topics, the peer's profile.
    pub async fn topics_for_user(&self, uid: Uid, keep_deleted: bool) -> Result<Vec<Subscription>> {
        let skip_pseudo = vec![
            Filter::NotEqual(ATTR_TOPIC.to_string(), AttrValue::S(uid.user_id())),
            Filter::NotEqual(ATTR_TOPIC.to_string(), AttrValue::S(uid.fnd_name())),
        ];
        let request = self.by_user(uid, keep_deleted, skip_pseudo);
        let rows = self.query_all(request, None, FailurePolicy::Abort).await?;

        let mut subs = Vec::with_capacity(rows.len());
        let mut join: HashMap<String, usize> = HashMap::new();
        let mut topic_keys = Vec::new();
        let mut user_keys = Vec::new();
        for row in &rows {
            let sub = item_to_sub(row)?;
            match TopicCat::of(&sub.topic) {
                TopicCat::Me | TopicCat::Fnd => continue,
                TopicCat::P2P => user_keys.push(user_key(uid.p2p_peer(&sub.topic)?)),
                TopicCat::Grp => {}
            }
            topic_keys.push(topic_key(&sub.topic));
            join.insert(sub.topic.clone(), subs.len());
            subs.push(sub);
        }

        for item in self
            .get_many(Table::Topics, topic_keys, None, FailurePolicy::Abort)
            .await?
        {
            let topic = item_to_topic(&item)?;
            if let Some(&i) = join.get(topic.name()) {
                let sub = &mut subs[i];
                sub.header.merge_times(&topic.header);
                sub.seq_id = topic.seq_id;
                sub.hard_clear_id = topic.clear_id;
                if TopicCat::of(&sub.topic) == TopicCat::Grp {
                    sub.public = topic.public;
                }
            }
        }

        for item in self
            .get_many(Table::Users, user_keys, None, FailurePolicy::Abort)
            .await?
        {
            let peer = item_to_user(&item)?;
            let peer_uid = peer.uid();
            let Some(name) = uid.p2p_name(peer_uid) else {
                continue;
            };
            if let Some(&i) = join.get(&name) {
                let sub = &mut subs[i];
                sub.header.merge_times(&peer.header);
                sub.public = peer.public;
                sub.with = peer_uid.user_id();
                sub.default_access = Some(peer.access);
                sub.last_seen = peer.last_seen;
                sub.user_agent = peer.user_agent;
            }
        }

        Ok(subs)
    }

    /// Subscribers of `topic`, each enriched with the subscriber's public
    /// profile. Best effort: subscribers whose user row could not be
    /// fetched come back without a profile.
    pub async fn users_for_topic(
        &self,
        topic: &str,
        keep_deleted: bool,
    ) -> Result<Vec<Subscription>> {
        let request = self.by_topic(topic, keep_deleted);
        let rows = self
            .query_all(request, None, FailurePolicy::LogAndContinue)
            .await?;

        let mut subs = Vec::with_capacity(rows.len());
        let mut join: HashMap<String, usize> = HashMap::new();
        for row in &rows {
            let sub = item_to_sub(row)?;
            join.insert(sub.user.clone(), subs.len());
            subs.push(sub);
        }

        let keys = subs
            .iter()
            .filter_map(|s| Uid::parse(&s.user).ok())
            .map(user_key)
            .collect();
        for item in self
            .get_many(Table::Users, keys, None, FailurePolicy::LogAndContinue)
            .await?
        {
            let user = match item_to_user(&item) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "skipping malformed user row");
                    continue;
                }
            };
            if let Some(&i) = join.get(&user.header.id) {
                subs[i].header.merge_times(&user.header);
                subs[i].public = user.public;
            }
        }

        Ok(subs)
    }

    /// Subscribers of `topic`. On one-to-one topics each subscription is
    /// given the other party's profile and default access.
    pub async fn subs_for_topic(&self, topic: &str, keep_deleted: bool) -> Result<Vec<Subscription>> {
        let participants = if TopicCat::of(topic) == TopicCat::P2P {
            let (a, b) = courier_shared::types::parse_p2p(topic)?;
            let users = self.get_users(&[a, b]).await?;
            if users.len() != 2 {
                return Err(StoreError::NotFound(format!(
                    "participants of {topic}: found {} of 2",
                    users.len()
                )));
            }
            Some(users)
        } else {
            None
        };

        let request = self.by_topic(topic, keep_deleted);
        let mut subs: Vec<Subscription> = self
            .query_all(request, None, FailurePolicy::Abort)
            .await?
            .iter()
            .map(item_to_sub)
            .collect::<Result<_>>()?;

        if let Some(users) = participants {
            for sub in &mut subs {
                let other = if users[0].header.id == sub.user {
                    &users[1]
                } else {
                    &users[0]
                };
                sub.public = other.public.clone();
                sub.with = other.uid().user_id();
                sub.default_access = Some(other.access);
            }
        }
        Ok(subs)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a partial update. Fails with [`StoreError::NotFound`] if the
    /// subscription does not exist.
    pub async fn update_subscription(&self, topic: &str, user: Uid, patch: Patch) -> Result<()> {
        self.update(
            Table::Subscriptions,
            &subscription_key(topic, user),
            patch.into_actions(),
            Precondition::MustExist,
        )
        .await
        .map_err(|e| match e {
            StoreError::Conflict { .. } => {
                StoreError::NotFound(format!("subscription {}", subscription_id(topic, &user.to_string())))
            }
            other => other,
        })
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Soft delete: the row stays, with `UpdatedAt` and `DeletedAt` set to
    /// now. Deleting an absent subscription is a no-op.
    pub async fn delete_subscription(&self, topic: &str, user: Uid) -> Result<()> {
        let now = AttrValue::time(self.now());
        absorb_conflict(
            self.update(
                Table::Subscriptions,
                &subscription_key(topic, user),
                vec![
                    UpdateAction::Set(AttrPath::attr(ATTR_UPDATED_AT), now.clone()),
                    UpdateAction::Set(AttrPath::attr(ATTR_DELETED_AT), now),
                ],
                Precondition::MustExist,
            )
            .await,
        )?;
        Ok(())
    }

    /// Soft delete every subscription to `topic`. Returns the number of
    /// subscriptions touched.
    pub async fn delete_subs_for_topic(&self, topic: &str) -> Result<usize> {
        let request = self
            .query(Table::Subscriptions, ATTR_TOPIC, topic)
            .index(INDEX_SUBS_TOPIC)
            .project(&[ATTR_USER]);
        let rows = self.query_all(request, None, FailurePolicy::Abort).await?;

        let users = rows
            .iter()
            .map(|row| -> Result<Uid> { Ok(Uid::parse(&row.req_s(ATTR_USER)?)?) })
            .collect::<Result<Vec<Uid>>>()?;
        let deleted = fan_out(users, self.parallelism(), FailurePolicy::Abort, |uid| {
            self.delete_subscription(topic, uid)
        })
        .await?;
        tracing::debug!(topic, count = deleted.len(), "subscriptions deleted");
        Ok(deleted.len())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn by_user(&self, uid: Uid, keep_deleted: bool, mut filters: Vec<Filter>) -> QueryRequest {
        if !keep_deleted {
            filters.push(Filter::Absent(ATTR_DELETED_AT.to_string()));
        }
        let request = self
            .query(Table::Subscriptions, ATTR_USER, uid.to_string())
            .index(INDEX_SUBS_USER_UPDATED_AT);
        with_filters(request, filters)
    }

    fn by_topic(&self, topic: &str, keep_deleted: bool) -> QueryRequest {
        let request = self
            .query(Table::Subscriptions, ATTR_TOPIC, topic)
            .index(INDEX_SUBS_TOPIC);
        if keep_deleted {
            request
        } else {
            request.filter(Filter::Absent(ATTR_DELETED_AT.to_string()))
        }
    }
}

fn with_filters(request: QueryRequest, mut filters: Vec<Filter>) -> QueryRequest {
    match filters.len() {
        0 => request,
        1 => request.filter(filters.remove(0)),
        _ => request.filter(Filter::All(filters)),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Encode a subscription, assigning its `<topic>:<user>` id.
pub(crate) fn sub_to_item(sub: &Subscription) -> Item {
    let mut header = sub.header.clone();
    header.id = subscription_id(&sub.topic, &sub.user);

    let mut item = Item::new();
    put_header(&mut item, &header);
    item.insert(ATTR_USER.to_string(), AttrValue::from(sub.user.as_str()));
    item.insert(ATTR_TOPIC.to_string(), AttrValue::from(sub.topic.as_str()));
    item.insert(ATTR_CLEAR_ID.to_string(), AttrValue::int(sub.clear_id));
    item.insert(ATTR_RECV_SEQ_ID.to_string(), AttrValue::int(sub.recv_seq_id));
    item.insert(ATTR_READ_SEQ_ID.to_string(), AttrValue::int(sub.read_seq_id));
    item.insert(ATTR_MODE_WANT.to_string(), AttrValue::S(sub.mode_want.to_string()));
    item.insert(ATTR_MODE_GIVEN.to_string(), AttrValue::S(sub.mode_given.to_string()));
    item.insert(ATTR_PRIVATE.to_string(), opt_json_attr(sub.private.as_ref()));
    item
}

pub(crate) fn item_to_sub(item: &Item) -> Result<Subscription> {
    let mode = |name: &str| -> Result<AccessMode> {
        match item.opt_s(name) {
            Some(s) => Ok(s.parse()?),
            None => Ok(AccessMode::NONE),
        }
    };
    Ok(Subscription {
        header: read_header(item)?,
        user: item.req_s(ATTR_USER)?,
        topic: item.req_s(ATTR_TOPIC)?,
        clear_id: item.int_or_zero(ATTR_CLEAR_ID),
        recv_seq_id: item.int_or_zero(ATTR_RECV_SEQ_ID),
        read_seq_id: item.int_or_zero(ATTR_READ_SEQ_ID),
        mode_want: mode(ATTR_MODE_WANT)?,
        mode_given: mode(ATTR_MODE_GIVEN)?,
        private: item.opt_json(ATTR_PRIVATE),
        ..Default::default()
    })
}
