//! Table layout and key construction.
//!
//! ```text
//! Users          Id (S)                      devices live in the Devices map
//! Auth           unique (S)                  GSI userid(userid)
//! TagUnique      Id (S)                      GSI Source(Source)
//! Topics         Id (S)
//! Subscriptions  Id (S) = "<topic>:<user>"   GSI UserUpdatedAt(User, UpdatedAt)
//!                                            GSI Topic(Topic)
//! Messages       Topic (S) + SeqId (N)       TTL on ExpireTime
//! ```
//!
//! Every key is a pure function of entity fields; point lookups only work if
//! callers build keys through these helpers.

use courier_shared::constants::SUBSCRIPTION_ID_SEPARATOR;
use courier_shared::Uid;

use crate::config::{StoreConfig, Throughput};
use crate::item::{AttrValue, Item};

/// Maximum keys accepted by one batch read.
pub const MAX_BATCH_GET_ITEMS: usize = 100;

/// Maximum requests accepted by one batch write.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

// Users, Topics, TagUnique, Subscriptions
pub const ATTR_ID: &str = "Id";
pub const ATTR_CREATED_AT: &str = "CreatedAt";
pub const ATTR_UPDATED_AT: &str = "UpdatedAt";
pub const ATTR_DELETED_AT: &str = "DeletedAt";
pub const ATTR_ACCESS: &str = "Access";
pub const ATTR_ACCESS_AUTH: &str = "Auth";
pub const ATTR_ACCESS_ANON: &str = "Anon";
pub const ATTR_PUBLIC: &str = "Public";
pub const ATTR_PRIVATE: &str = "Private";
pub const ATTR_TAGS: &str = "Tags";
pub const ATTR_DEVICES: &str = "Devices";
pub const ATTR_LAST_SEEN: &str = "LastSeen";
pub const ATTR_USER_AGENT: &str = "UserAgent";
pub const ATTR_SEQ_ID: &str = "SeqId";
pub const ATTR_CLEAR_ID: &str = "ClearId";
pub const ATTR_USER: &str = "User";
pub const ATTR_TOPIC: &str = "Topic";
pub const ATTR_RECV_SEQ_ID: &str = "RecvSeqId";
pub const ATTR_READ_SEQ_ID: &str = "ReadSeqId";
pub const ATTR_MODE_WANT: &str = "ModeWant";
pub const ATTR_MODE_GIVEN: &str = "ModeGiven";
pub const ATTR_SOURCE: &str = "Source";

// Messages
pub const ATTR_FROM: &str = "From";
pub const ATTR_HEAD: &str = "Head";
pub const ATTR_CONTENT: &str = "Content";
pub const ATTR_DELETED_FOR: &str = "DeletedFor";
pub const ATTR_TIMESTAMP: &str = "Timestamp";
pub const ATTR_EXPIRE_TIME: &str = "ExpireTime";

// Auth
pub const ATTR_UNIQUE: &str = "unique";
pub const ATTR_USER_ID: &str = "userid";
pub const ATTR_AUTH_LVL: &str = "authLvl";
pub const ATTR_SECRET: &str = "secret";
pub const ATTR_EXPIRES: &str = "expires";

// Devices map entries
pub const ATTR_DEVICE_ID: &str = "DeviceId";
pub const ATTR_PLATFORM: &str = "Platform";
pub const ATTR_LANG: &str = "Lang";

pub const INDEX_AUTH_USER_ID: &str = "userid";
pub const INDEX_TAG_SOURCE: &str = "Source";
pub const INDEX_SUBS_USER_UPDATED_AT: &str = "UserUpdatedAt";
pub const INDEX_SUBS_TOPIC: &str = "Topic";

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Auth,
    TagUnique,
    Topics,
    Subscriptions,
    Messages,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Users,
        Table::Auth,
        Table::TagUnique,
        Table::Topics,
        Table::Subscriptions,
        Table::Messages,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    S,
    N,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAttr {
    pub name: &'static str,
    pub key_type: KeyType,
}

impl KeyAttr {
    const fn s(name: &'static str) -> Self {
        Self {
            name,
            key_type: KeyType::S,
        }
    }

    const fn n(name: &'static str) -> Self {
        Self {
            name,
            key_type: KeyType::N,
        }
    }
}

/// Hash key plus optional range key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    pub hash: KeyAttr,
    pub range: Option<KeyAttr>,
}

impl KeyLayout {
    /// Attribute names making up this layout.
    pub fn attrs(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.hash.name).chain(self.range.map(|r| r.name))
    }

    /// Copy just the key attributes out of a full item.
    pub fn extract(&self, item: &Item) -> Item {
        self.attrs()
            .filter_map(|name| item.get(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: &'static str,
    pub key: KeyLayout,
    pub throughput: Throughput,
}

/// Full description of one table as created at bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table: Table,
    pub name: String,
    pub key: KeyLayout,
    pub indexes: Vec<IndexSchema>,
    pub throughput: Throughput,
    pub ttl_attr: Option<&'static str>,
}

impl TableSchema {
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// The six table layouts with names and throughput taken from `config`.
pub fn table_schemas(config: &StoreConfig) -> Vec<TableSchema> {
    let tables = &config.table_config;
    let indexes = &config.index_config;
    let id_only = KeyLayout {
        hash: KeyAttr::s(ATTR_ID),
        range: None,
    };

    vec![
        TableSchema {
            table: Table::Users,
            name: tables.users.name.clone(),
            key: id_only,
            indexes: Vec::new(),
            throughput: tables.users.provisioned_throughput,
            ttl_attr: None,
        },
        TableSchema {
            table: Table::Auth,
            name: tables.auth.name.clone(),
            key: KeyLayout {
                hash: KeyAttr::s(ATTR_UNIQUE),
                range: None,
            },
            indexes: vec![IndexSchema {
                name: INDEX_AUTH_USER_ID,
                key: KeyLayout {
                    hash: KeyAttr::s(ATTR_USER_ID),
                    range: None,
                },
                throughput: indexes.userid.provisioned_throughput,
            }],
            throughput: tables.auth.provisioned_throughput,
            ttl_attr: None,
        },
        TableSchema {
            table: Table::TagUnique,
            name: tables.tagunique.name.clone(),
            key: id_only,
            indexes: vec![IndexSchema {
                name: INDEX_TAG_SOURCE,
                key: KeyLayout {
                    hash: KeyAttr::s(ATTR_SOURCE),
                    range: None,
                },
                throughput: indexes.source.provisioned_throughput,
            }],
            throughput: tables.tagunique.provisioned_throughput,
            ttl_attr: None,
        },
        TableSchema {
            table: Table::Topics,
            name: tables.topics.name.clone(),
            key: id_only,
            indexes: Vec::new(),
            throughput: tables.topics.provisioned_throughput,
            ttl_attr: None,
        },
        TableSchema {
            table: Table::Subscriptions,
            name: tables.subscriptions.name.clone(),
            key: id_only,
            indexes: vec![
                IndexSchema {
                    name: INDEX_SUBS_USER_UPDATED_AT,
                    key: KeyLayout {
                        hash: KeyAttr::s(ATTR_USER),
                        range: Some(KeyAttr::s(ATTR_UPDATED_AT)),
                    },
                    throughput: indexes.user_updated_at.provisioned_throughput,
                },
                IndexSchema {
                    name: INDEX_SUBS_TOPIC,
                    key: KeyLayout {
                        hash: KeyAttr::s(ATTR_TOPIC),
                        range: None,
                    },
                    throughput: indexes.topic.provisioned_throughput,
                },
            ],
            throughput: tables.subscriptions.provisioned_throughput,
            ttl_attr: None,
        },
        TableSchema {
            table: Table::Messages,
            name: tables.messages.name.clone(),
            key: KeyLayout {
                hash: KeyAttr::s(ATTR_TOPIC),
                range: Some(KeyAttr::n(ATTR_SEQ_ID)),
            },
            indexes: Vec::new(),
            throughput: tables.messages.provisioned_throughput,
            ttl_attr: Some(ATTR_EXPIRE_TIME),
        },
    ]
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

fn single_key(attr: &str, value: impl Into<AttrValue>) -> Item {
    Item::from([(attr.to_string(), value.into())])
}

pub fn user_key(uid: Uid) -> Item {
    single_key(ATTR_ID, uid.to_string())
}

pub fn auth_key(unique: &str) -> Item {
    single_key(ATTR_UNIQUE, unique)
}

pub fn tag_key(tag: &str) -> Item {
    single_key(ATTR_ID, tag)
}

pub fn topic_key(topic: &str) -> Item {
    single_key(ATTR_ID, topic)
}

/// `<topic>:<user>`, with no escaping.
pub fn subscription_id(topic: &str, user: &str) -> String {
    format!("{topic}{SUBSCRIPTION_ID_SEPARATOR}{user}")
}

pub fn subscription_key(topic: &str, user: Uid) -> Item {
    single_key(ATTR_ID, subscription_id(topic, &user.to_string()))
}

pub fn message_key(topic: &str, seq_id: i64) -> Item {
    Item::from([
        (ATTR_TOPIC.to_string(), AttrValue::from(topic)),
        (ATTR_SEQ_ID.to_string(), AttrValue::int(seq_id)),
    ])
}

/// Map key of a device inside a user's `Devices` attribute: the unpadded
/// lowercase hex of the 64-bit FNV-1a hash of the raw device id, so any
/// identifier maps to a short, stable key.
pub fn device_key(device_id: &str) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = device_id.bytes().fold(FNV_OFFSET_BASIS, |acc, b| {
        (acc ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    });
    format!("{hash:x}")
}
