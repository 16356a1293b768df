//! Message retention.
//!
//! Every message is written with an absolute expiry instant picked by topic
//! category; the backend's TTL sweeper removes it physically. "Clearing" a
//! topic only moves a watermark.

use chrono::{DateTime, Duration, Utc};

use courier_shared::constants::{EXPIRE_SECS_GROUP, EXPIRE_SECS_P2P, EXPIRE_SECS_SELF};
use courier_shared::types::parse_p2p;
use courier_shared::{TopicCat, Uid};

use crate::error::Result;

/// Lifetime of a message posted to a topic of category `cat`.
pub fn lifetime(cat: TopicCat) -> Duration {
    let secs = match cat {
        TopicCat::P2P => EXPIRE_SECS_P2P,
        TopicCat::Me => EXPIRE_SECS_SELF,
        TopicCat::Grp | TopicCat::Fnd => EXPIRE_SECS_GROUP,
    };
    Duration::seconds(secs)
}

/// Expiry instant of a message written to `topic` at `now`.
pub fn expiry(topic: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    now + lifetime(TopicCat::of(topic))
}

/// Where a topic's clear watermark lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watermark {
    /// `Topics.ClearId` of a group topic.
    Topic(String),
    /// `Users.ClearId` of the self channel's owner.
    User(Uid),
    /// `ClearId` on both participants' subscriptions.
    Subscriptions(String, [Uid; 2]),
    /// Discovery channels hold no messages.
    None,
}

pub fn watermark(topic: &str) -> Result<Watermark> {
    Ok(match TopicCat::of(topic) {
        TopicCat::Grp => Watermark::Topic(topic.to_string()),
        TopicCat::Me => Watermark::User(Uid::parse_user_id(topic)?),
        TopicCat::P2P => {
            let (a, b) = parse_p2p(topic)?;
            Watermark::Subscriptions(topic.to_string(), [a, b])
        }
        TopicCat::Fnd => Watermark::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expiry_by_category() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let me = Uid(11);
        let p2p = me.p2p_name(Uid(12)).unwrap();

        assert_eq!(expiry(&p2p, t).timestamp(), t.timestamp() + 31_536_000);
        assert_eq!(expiry("grpAbc", t).timestamp(), t.timestamp() + 604_800);
        assert_eq!(expiry(&me.user_id(), t).timestamp(), t.timestamp() + 2_592_000);
    }

    #[test]
    fn test_watermark_targets() {
        let a = Uid(3);
        let b = Uid(9);
        let p2p = b.p2p_name(a).unwrap();
        assert_eq!(
            watermark(&p2p).unwrap(),
            Watermark::Subscriptions(p2p.clone(), [a, b])
        );
        assert_eq!(watermark(&a.user_id()).unwrap(), Watermark::User(a));
        assert_eq!(watermark("grpX").unwrap(), Watermark::Topic("grpX".into()));
        assert_eq!(watermark(&a.fnd_name()).unwrap(), Watermark::None);
    }
}
