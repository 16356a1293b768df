//! Domain records persisted by the store.
//!
//! Every struct derives `Serialize` and `Deserialize` so the hub can hand
//! them straight to its wire layer. Opaque client blobs (`public`,
//! `private`, message `head`/`content`) are kept as JSON values and stored
//! verbatim.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_shared::{AccessMode, DefaultAccess, ObjHeader, Uid};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A push endpoint registered by one of the user's devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDef {
    /// Push-service registration id, as supplied by the device.
    pub device_id: String,
    pub platform: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub lang: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub header: ObjHeader,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub private: Option<Value>,
    /// Discoverable tags. Each one is globally unique.
    pub tags: Vec<String>,
    /// Keyed by the hash produced by [`device_key`](crate::schema::device_key).
    pub devices: BTreeMap<String, DeviceDef>,
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: String,
    /// Highest sequence id issued on the user's self channel.
    pub seq_id: i64,
    /// Clear watermark of the self channel.
    pub clear_id: i64,
}

impl User {
    pub fn new(uid: Uid, now: DateTime<Utc>) -> Self {
        Self {
            header: ObjHeader::new(uid.to_string(), now),
            ..Default::default()
        }
    }

    pub fn uid(&self) -> Uid {
        Uid::parse(&self.header.id).unwrap_or(Uid::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// A stored credential. `unique` is scheme-qualified, e.g. `basic:alice`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRecord {
    pub unique: String,
    pub user: Uid,
    pub auth_level: i64,
    pub secret: Vec<u8>,
    pub expires: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub header: ObjHeader,
    pub access: DefaultAccess,
    /// Highest message sequence id issued on this topic.
    pub seq_id: i64,
    /// Messages with ids below this watermark are cleared for everyone.
    pub clear_id: i64,
    pub public: Option<Value>,
}

impl Topic {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            header: ObjHeader::new(name, now),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.header.id
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One row per (topic, user) pair.
///
/// The trailing fields are never persisted: read paths fill them in from the
/// referenced topic and user rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    /// `id` is `<topic>:<user>`, assigned by the store on write.
    pub header: ObjHeader,
    pub user: String,
    pub topic: String,
    /// Per-user clear watermark (one-to-one topics).
    pub clear_id: i64,
    pub recv_seq_id: i64,
    pub read_seq_id: i64,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,

    /// Peer's self channel on one-to-one topics.
    #[serde(skip)]
    pub with: String,
    #[serde(skip)]
    pub seq_id: i64,
    /// Topic-wide clear watermark.
    #[serde(skip)]
    pub hard_clear_id: i64,
    #[serde(skip)]
    pub public: Option<Value>,
    #[serde(skip)]
    pub default_access: Option<DefaultAccess>,
    #[serde(skip)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub user_agent: String,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, user: Uid, now: DateTime<Utc>) -> Self {
        Self {
            header: ObjHeader::new(String::new(), now),
            user: user.to_string(),
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn uid(&self) -> Uid {
        Uid::parse(&self.user).unwrap_or(Uid::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Per-viewer deletion marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftDelete {
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// `deleted_at` is the hard-delete time. On reads it also surfaces the
    /// requester's own soft-delete time.
    pub header: ObjHeader,
    pub topic: String,
    pub seq_id: i64,
    pub from: String,
    pub head: Option<Value>,
    pub content: Value,
    pub deleted_for: Vec<SoftDelete>,
    /// Absolute expiry instant, assigned on save.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bounds for a history query: sequence ids in `[since, before)`, newest
/// first, at most `limit` messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseOpt {
    pub since: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

/// Devices of several users, flattened per user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub devices: HashMap<Uid, Vec<DeviceDef>>,
    /// Total number of devices across all users.
    pub count: usize,
}
