//! The per-topic message log.
//!
//! Rows are keyed by `(Topic, SeqId)`. Sequence ids are assigned by the
//! caller. Rows are never removed by the store: they expire through the
//! backend's TTL sweep on `ExpireTime`.

use std::collections::BTreeMap;

use courier_shared::constants::MAX_MESSAGES_RETRIEVED;
use courier_shared::Uid;

use crate::backend::{AttrPath, Precondition, UpdateAction};
use crate::conditional::absorb_conflict;
use crate::error::{Result, StoreError};
use crate::fanout::fan_out;
use crate::item::{opt_json_attr, put_header, read_header, AttrValue, Item, ItemExt};
use crate::models::{BrowseOpt, Message, SoftDelete};
use crate::pager::FailurePolicy;
use crate::retention::{self, Watermark};
use crate::schema::*;
use crate::store::Store;

impl Store {
    /// Write a message, stamping its expiry from the topic category.
    pub async fn save_message(&self, msg: &mut Message) -> Result<()> {
        let expires_at = retention::expiry(&msg.topic, self.now());
        msg.expires_at = Some(expires_at);
        self.put(Table::Messages, message_to_item(msg), Precondition::None)
            .await?;
        tracing::trace!(topic = %msg.topic, seq = msg.seq_id, "message saved");
        Ok(())
    }

    /// Messages with sequence ids in `[since, before)`, newest first.
    ///
    /// Each message's `deleted_at` is replaced by the requester's own
    /// soft-delete time when the requester has hidden it.
    pub async fn get_messages(
        &self,
        topic: &str,
        for_user: Uid,
        opts: BrowseOpt,
    ) -> Result<Vec<Message>> {
        let since = opts.since.filter(|s| *s > 0).unwrap_or(0);
        let before = opts.before.filter(|b| *b > 0).unwrap_or(i64::MAX);
        let limit = match opts.limit {
            Some(n) if n > 0 => n.min(MAX_MESSAGES_RETRIEVED),
            _ => MAX_MESSAGES_RETRIEVED,
        };
        if before <= since {
            return Ok(Vec::new());
        }

        let request = self
            .query(Table::Messages, ATTR_TOPIC, topic)
            .between(ATTR_SEQ_ID, AttrValue::int(since), AttrValue::int(before - 1))
            .descending();
        let rows = self
            .query_all(request, Some(limit), FailurePolicy::Abort)
            .await?;

        let requester = for_user.to_string();
        rows.iter()
            .map(|row| -> Result<Message> {
                let mut msg = item_to_message(row)?;
                if let Some(mine) = msg.deleted_for.iter().find(|d| d.user == requester) {
                    msg.header.deleted_at = Some(mine.timestamp);
                }
                Ok(msg)
            })
            .collect()
    }

    /// Mark every message below `before` as cleared by moving the topic's
    /// watermark. No row is removed. Missing watermark rows are ignored.
    pub async fn clear_messages(&self, topic: &str, before: i64) -> Result<()> {
        let targets = match retention::watermark(topic)? {
            Watermark::Topic(name) => vec![(Table::Topics, topic_key(&name))],
            Watermark::User(uid) => vec![(Table::Users, user_key(uid))],
            Watermark::Subscriptions(name, pair) => pair
                .iter()
                .map(|uid| (Table::Subscriptions, subscription_key(&name, *uid)))
                .collect(),
            Watermark::None => return Ok(()),
        };

        for (table, key) in targets {
            let moved = absorb_conflict(
                self.update(
                    table,
                    &key,
                    vec![UpdateAction::Set(
                        AttrPath::attr(ATTR_CLEAR_ID),
                        AttrValue::int(before),
                    )],
                    Precondition::MustExist,
                )
                .await,
            )?;
            if !moved {
                tracing::debug!(topic, ?table, "no row holds the clear watermark");
            }
        }
        Ok(())
    }

    /// Delete individual messages. A hard delete stamps `DeletedAt` for
    /// everyone; a soft delete hides the message from `for_user` only.
    /// Unknown sequence ids are skipped.
    pub async fn delete_messages(
        &self,
        topic: &str,
        for_user: Uid,
        hard: bool,
        seq_ids: &[i64],
    ) -> Result<()> {
        let now = self.now();
        let action = if hard {
            UpdateAction::Set(AttrPath::attr(ATTR_DELETED_AT), AttrValue::time(now))
        } else {
            let marker = SoftDelete {
                user: for_user.to_string(),
                timestamp: now,
            };
            UpdateAction::Append(AttrPath::attr(ATTR_DELETED_FOR), vec![soft_delete_attr(&marker)])
        };

        let applied = fan_out(
            seq_ids.iter().copied(),
            self.parallelism(),
            FailurePolicy::Abort,
            |seq_id| {
                let action = action.clone();
                async move {
                    absorb_conflict(
                        self.update(
                            Table::Messages,
                            &message_key(topic, seq_id),
                            vec![action],
                            Precondition::MustExist,
                        )
                        .await,
                    )
                }
            },
        )
        .await?;
        tracing::debug!(
            topic,
            hard,
            requested = seq_ids.len(),
            applied = applied.iter().filter(|a| **a).count(),
            "messages deleted"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn message_to_item(msg: &Message) -> Item {
    let mut item = Item::new();
    put_header(&mut item, &msg.header);
    item.insert(ATTR_TOPIC.to_string(), AttrValue::from(msg.topic.as_str()));
    item.insert(ATTR_SEQ_ID.to_string(), AttrValue::int(msg.seq_id));
    item.insert(ATTR_FROM.to_string(), AttrValue::from(msg.from.as_str()));
    item.insert(ATTR_HEAD.to_string(), opt_json_attr(msg.head.as_ref()));
    item.insert(ATTR_CONTENT.to_string(), AttrValue::from(&msg.content));
    item.insert(
        ATTR_DELETED_FOR.to_string(),
        AttrValue::L(msg.deleted_for.iter().map(soft_delete_attr).collect()),
    );
    if let Some(expires_at) = msg.expires_at {
        item.insert(ATTR_EXPIRE_TIME.to_string(), AttrValue::int(expires_at.timestamp()));
    }
    item
}

fn item_to_message(item: &Item) -> Result<Message> {
    let deleted_for = match item.get(ATTR_DELETED_FOR) {
        Some(AttrValue::L(entries)) => entries
            .iter()
            .map(read_soft_delete)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let expires_at = item
        .attr(ATTR_EXPIRE_TIME)
        .and_then(AttrValue::as_i64)
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));

    Ok(Message {
        header: read_header(item)?,
        topic: item.req_s(ATTR_TOPIC)?,
        seq_id: item.req_i64(ATTR_SEQ_ID)?,
        from: item.opt_s(ATTR_FROM).unwrap_or_default(),
        head: item.opt_json(ATTR_HEAD),
        content: item.opt_json(ATTR_CONTENT).unwrap_or_default(),
        deleted_for,
        expires_at,
    })
}

fn read_soft_delete(entry: &AttrValue) -> Result<SoftDelete> {
    match entry {
        AttrValue::M(fields) => Ok(SoftDelete {
            user: fields.req_s(ATTR_USER)?,
            timestamp: fields.time_or_epoch(ATTR_TIMESTAMP)?,
        }),
        other => Err(StoreError::codec(format!(
            "malformed soft-delete entry: {other:?}"
        ))),
    }
}

fn soft_delete_attr(marker: &SoftDelete) -> AttrValue {
    AttrValue::M(BTreeMap::from([
        (ATTR_USER.to_string(), AttrValue::from(marker.user.as_str())),
        (ATTR_TIMESTAMP.to_string(), AttrValue::time(marker.timestamp)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::models::{Subscription, Topic, User};
    use crate::store::test_support::{fixed_now, store_with, test_store};
    use courier_shared::ObjHeader;
    use rand::seq::SliceRandom;
    use serde_json::json;

    fn message(topic: &str, seq_id: i64) -> Message {
        Message {
            header: ObjHeader::new(format!("m{seq_id}"), fixed_now()),
            topic: topic.to_string(),
            seq_id,
            from: Uid(1).to_string(),
            content: json!(format!("hello {seq_id}")),
            ..Default::default()
        }
    }

    async fn fill(store: &Store, topic: &str, count: i64) {
        for seq in 1..=count {
            store.save_message(&mut message(topic, seq)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_expiry_per_category() {
        let (store, backend) = test_store().await;
        let t = fixed_now().timestamp();
        let me = Uid(11);
        let p2p = me.p2p_name(Uid(12)).unwrap();
        let own = me.user_id();

        for (topic, secs) in [
            (p2p.as_str(), 31_536_000),
            ("grpAbc", 604_800),
            (own.as_str(), 2_592_000),
        ] {
            let mut msg = message(topic, 1);
            store.save_message(&mut msg).await.unwrap();
            assert_eq!(msg.expires_at.unwrap().timestamp(), t + secs);

            let raw = backend
                .get_item(store.table(Table::Messages), &message_key(topic, 1), None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(raw.get(ATTR_EXPIRE_TIME), Some(&AttrValue::int(t + secs)));
            assert_eq!(raw.get(ATTR_DELETED_FOR), Some(&AttrValue::L(Vec::new())));
        }
    }

    #[tokio::test]
    async fn test_range_pagination() {
        let (store, backend) = store_with(MemoryBackend::new().with_page_size(40)).await;
        // Insertion order must not matter.
        let mut order: Vec<i64> = (1..=250).collect();
        order.shuffle(&mut rand::thread_rng());
        for seq in order {
            store.save_message(&mut message("grpLog", seq)).await.unwrap();
        }

        let opts = BrowseOpt {
            since: Some(1),
            before: Some(251),
            limit: Some(100),
        };
        let msgs = store.get_messages("grpLog", Uid(1), opts).await.unwrap();
        let seqs: Vec<i64> = msgs.iter().map(|m| m.seq_id).collect();
        assert_eq!(seqs, (151..=250).rev().collect::<Vec<_>>());
        assert!(backend.query_calls() >= 3);

        let msg = &msgs[0];
        assert_eq!(msg.content, json!("hello 250"));
        assert_eq!(msg.header.id, "m250");
    }

    #[tokio::test]
    async fn test_range_bounds() {
        let (store, _) = test_store().await;
        fill(&store, "grpLog", 20).await;

        let window = BrowseOpt {
            since: Some(5),
            before: Some(10),
            limit: None,
        };
        let seqs: Vec<i64> = store
            .get_messages("grpLog", Uid(1), window)
            .await
            .unwrap()
            .iter()
            .map(|m| m.seq_id)
            .collect();
        assert_eq!(seqs, vec![9, 8, 7, 6, 5]);

        let all = store
            .get_messages("grpLog", Uid(1), BrowseOpt::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 20);

        let inverted = BrowseOpt {
            since: Some(10),
            before: Some(10),
            limit: None,
        };
        assert!(store
            .get_messages("grpLog", Uid(1), inverted)
            .await
            .unwrap()
            .is_empty());

        let capped = BrowseOpt {
            limit: Some(5_000),
            ..Default::default()
        };
        fill(&store, "grpMany", 150).await;
        assert_eq!(
            store.get_messages("grpMany", Uid(1), capped).await.unwrap().len(),
            100
        );
    }

    #[tokio::test]
    async fn test_soft_delete_is_per_viewer() {
        let (store, _) = test_store().await;
        fill(&store, "grpLog", 3).await;

        store
            .delete_messages("grpLog", Uid(7), false, &[2, 3, 99])
            .await
            .unwrap();
        store.delete_messages("grpLog", Uid(8), false, &[2]).await.unwrap();

        let mine = store
            .get_messages("grpLog", Uid(7), BrowseOpt::default())
            .await
            .unwrap();
        let hidden: Vec<i64> = mine
            .iter()
            .filter(|m| m.header.deleted_at.is_some())
            .map(|m| m.seq_id)
            .collect();
        assert_eq!(hidden, vec![3, 2]);
        let two = mine.iter().find(|m| m.seq_id == 2).unwrap();
        assert_eq!(two.deleted_for.len(), 2);

        let others = store
            .get_messages("grpLog", Uid(9), BrowseOpt::default())
            .await
            .unwrap();
        assert!(others.iter().all(|m| m.header.deleted_at.is_none()));

        // Unknown ids are not materialised.
        let beyond = BrowseOpt {
            since: Some(99),
            ..Default::default()
        };
        assert!(store.get_messages("grpLog", Uid(7), beyond).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hard_delete_is_for_everyone() {
        let (store, _) = test_store().await;
        fill(&store, "grpLog", 3).await;
        store.delete_messages("grpLog", Uid(7), true, &[1]).await.unwrap();

        let msgs = store
            .get_messages("grpLog", Uid(9), BrowseOpt::default())
            .await
            .unwrap();
        let one = msgs.iter().find(|m| m.seq_id == 1).unwrap();
        assert_eq!(one.header.deleted_at, Some(fixed_now()));
        assert!(one.deleted_for.is_empty());
    }

    #[tokio::test]
    async fn test_clear_moves_watermark_only() {
        let (store, _) = test_store().await;
        store.create_topic(&Topic::new("grpLog", fixed_now())).await.unwrap();
        fill(&store, "grpLog", 10).await;

        store.clear_messages("grpLog", 5).await.unwrap();
        let below = BrowseOpt {
            since: Some(0),
            before: Some(5),
            limit: None,
        };
        assert_eq!(
            store.get_messages("grpLog", Uid(1), below).await.unwrap().len(),
            4
        );
        assert_eq!(store.get_topic("grpLog").await.unwrap().unwrap().clear_id, 5);

        store.clear_messages("grpLog", 8).await.unwrap();
        assert_eq!(store.get_topic("grpLog").await.unwrap().unwrap().clear_id, 8);

        // A missing row is tolerated and not created.
        store.clear_messages("grpGone", 3).await.unwrap();
        assert!(store.get_topic("grpGone").await.unwrap().is_none());
        store.clear_messages(&Uid(5).fnd_name(), 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_targets_by_category() {
        let (store, _) = test_store().await;
        let (a, b) = (Uid(21), Uid(22));
        store.create_user(&User::new(a, fixed_now())).await.unwrap();

        store.clear_messages(&a.user_id(), 6).await.unwrap();
        assert_eq!(store.get_user(a).await.unwrap().unwrap().clear_id, 6);

        let p2p = a.p2p_name(b).unwrap();
        store
            .create_p2p_topic(
                &Subscription::new(&p2p, a, fixed_now()),
                &Subscription::new(&p2p, b, fixed_now()),
            )
            .await
            .unwrap();
        store.clear_messages(&p2p, 4).await.unwrap();
        for uid in [a, b] {
            let sub = store.get_subscription(&p2p, uid).await.unwrap().unwrap();
            assert_eq!(sub.clear_id, 4);
        }
        assert_eq!(store.get_topic(&p2p).await.unwrap().unwrap().clear_id, 0);
    }
}
