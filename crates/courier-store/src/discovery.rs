//! Tag search: resolve public tags to their owners.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use courier_shared::constants::MAX_DISCOVERY_RESULTS;
use courier_shared::Uid;

use crate::error::Result;
use crate::item::{Item, ItemExt};
use crate::models::Subscription;
use crate::pager::FailurePolicy;
use crate::schema::{tag_key, user_key, Table, ATTR_ID, ATTR_SOURCE};
use crate::store::Store;
use crate::users::item_to_user;

impl Store {
    /// One synthetic subscription per user owning any of `tags`, excluding
    /// `requester`. The matched tag is carried in `private` as a one-element
    /// array. Best effort: chunks that fail to load are logged and skipped.
    pub async fn find_subs<S: AsRef<str>>(
        &self,
        requester: Uid,
        tags: &[S],
    ) -> Result<Vec<Subscription>> {
        let mut seen = HashSet::new();
        let keys: Vec<Item> = tags
            .iter()
            .map(|tag| -> &str { tag.as_ref() })
            .filter(|tag| seen.insert(*tag))
            .take(MAX_DISCOVERY_RESULTS)
            .map(tag_key)
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let projection = [ATTR_ID.to_string(), ATTR_SOURCE.to_string()];
        let records = self
            .get_many(
                Table::TagUnique,
                keys,
                Some(&projection[..]),
                FailurePolicy::LogAndContinue,
            )
            .await?;

        // First matching tag wins for each owner.
        let mut matched: HashMap<String, String> = HashMap::new();
        let mut owners = Vec::new();
        for record in &records {
            let (Some(tag), Some(owner)) = (record.opt_s(ATTR_ID), record.opt_s(ATTR_SOURCE))
            else {
                continue;
            };
            if owners.len() < MAX_DISCOVERY_RESULTS && !matched.contains_key(&owner) {
                matched.insert(owner.clone(), tag);
                owners.push(owner);
            }
        }

        let user_keys = owners
            .iter()
            .filter_map(|owner| Uid::parse(owner).ok())
            .map(user_key)
            .collect();
        let users = self
            .get_many(Table::Users, user_keys, None, FailurePolicy::LogAndContinue)
            .await?;

        let requester = requester.to_string();
        let mut subs = Vec::with_capacity(users.len());
        for item in &users {
            let user = match item_to_user(item) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed user row");
                    continue;
                }
            };
            if user.header.id == requester {
                continue;
            }
            let tag = matched.get(&user.header.id).cloned().unwrap_or_default();
            let mut sub = Subscription {
                user: user.header.id.clone(),
                public: user.public,
                private: Some(json!([tag])),
                ..Default::default()
            };
            sub.header.created_at = user.header.created_at;
            sub.header.updated_at = user.header.updated_at;
            subs.push(sub);
        }
        tracing::debug!(tags = tags.len(), found = subs.len(), "tag search");
        Ok(subs)
    }
}
