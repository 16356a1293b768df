use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{PREFIX_FIND, PREFIX_GROUP, PREFIX_P2P, PREFIX_SELF};
use crate::error::TypesError;

// ---------------------------------------------------------------------------
// Uid
// ---------------------------------------------------------------------------

/// Opaque 64-bit user identifier.
///
/// The string form is the URL-safe, unpadded base64 encoding of the id's
/// eight little-endian bytes (11 characters). The zero id is reserved as
/// "no user" and renders as the empty string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub u64);

impl Uid {
    pub const ZERO: Uid = Uid(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| TypesError::InvalidUid(s.to_string()))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| TypesError::InvalidUid(s.to_string()))?;
        Ok(Self(u64::from_le_bytes(arr)))
    }

    /// Parse the user id out of a self-channel name such as `usrAbC...`.
    pub fn parse_user_id(topic: &str) -> Result<Self, TypesError> {
        topic
            .strip_prefix(PREFIX_SELF)
            .ok_or_else(|| TypesError::InvalidUid(topic.to_string()))
            .and_then(Self::parse)
    }

    /// Name of this user's self channel.
    pub fn user_id(&self) -> String {
        format!("{PREFIX_SELF}{self}")
    }

    /// Name of this user's discovery channel.
    pub fn fnd_name(&self) -> String {
        format!("{PREFIX_FIND}{self}")
    }

    /// Name of the one-to-one topic between `self` and `other`.
    ///
    /// The lower id always comes first so both parties derive the same name.
    pub fn p2p_name(&self, other: Uid) -> Option<String> {
        if self.is_zero() || other.is_zero() {
            return None;
        }
        let (lo, hi) = if self.0 < other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&lo.to_le_bytes());
        buf.extend_from_slice(&hi.to_le_bytes());
        Some(format!("{PREFIX_P2P}{}", URL_SAFE_NO_PAD.encode(buf)))
    }

    /// The party on the other side of a one-to-one topic.
    pub fn p2p_peer(&self, topic: &str) -> Result<Uid, TypesError> {
        let (a, b) = parse_p2p(topic)?;
        Ok(if a == *self { b } else { a })
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            return Ok(());
        }
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_le_bytes()))
    }
}

impl std::str::FromStr for Uid {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Uid::ZERO);
        }
        Uid::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Split a one-to-one topic name into its two participants (lower id first).
pub fn parse_p2p(topic: &str) -> Result<(Uid, Uid), TypesError> {
    let not_p2p = || TypesError::NotP2P(topic.to_string());
    let encoded = topic.strip_prefix(PREFIX_P2P).ok_or_else(not_p2p)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| not_p2p())?;
    if bytes.len() != 16 {
        return Err(not_p2p());
    }
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&bytes[..8]);
    hi.copy_from_slice(&bytes[8..]);
    Ok((Uid(u64::from_le_bytes(lo)), Uid(u64::from_le_bytes(hi))))
}

// ---------------------------------------------------------------------------
// Topic category
// ---------------------------------------------------------------------------

/// Category of a topic, derived from the shape of its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicCat {
    /// A user's own channel, `usr<uid>`.
    Me,
    /// A user's discovery channel, `fnd<uid>`.
    Fnd,
    /// A one-to-one topic, `p2p<uid><uid>`.
    P2P,
    /// Everything else.
    Grp,
}

impl TopicCat {
    pub fn of(name: &str) -> Self {
        if name.starts_with(PREFIX_SELF) {
            TopicCat::Me
        } else if name.starts_with(PREFIX_FIND) {
            TopicCat::Fnd
        } else if parse_p2p(name).is_ok() {
            TopicCat::P2P
        } else {
            TopicCat::Grp
        }
    }

    /// Self and discovery channels keep their state on the user row.
    pub fn is_pseudo(&self) -> bool {
        matches!(self, TopicCat::Me | TopicCat::Fnd)
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            TopicCat::Me => PREFIX_SELF,
            TopicCat::Fnd => PREFIX_FIND,
            TopicCat::P2P => PREFIX_P2P,
            TopicCat::Grp => PREFIX_GROUP,
        }
    }
}

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

/// Identity and lifecycle timestamps common to users, topics and
/// subscriptions. The Unix epoch stands in for "never set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjHeader {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for ObjHeader {
    fn default() -> Self {
        Self {
            id: String::new(),
            created_at: DateTime::UNIX_EPOCH,
            updated_at: DateTime::UNIX_EPOCH,
            deleted_at: None,
        }
    }
}

impl ObjHeader {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Keep the earliest creation time and the latest update and delete
    /// times of the two headers.
    pub fn merge_times(&mut self, other: &ObjHeader) {
        if self.created_at == DateTime::UNIX_EPOCH
            || (other.created_at != DateTime::UNIX_EPOCH && other.created_at < self.created_at)
        {
            self.created_at = other.created_at;
        }
        if self.updated_at < other.updated_at {
            self.updated_at = other.updated_at;
        }
        if let Some(theirs) = other.deleted_at {
            if self.deleted_at.map_or(true, |ours| ours < theirs) {
                self.deleted_at = Some(theirs);
            }
        }
    }
}
