//! Typed attribute values and the helpers that turn them into domain data.
//!
//! The backing store is schema-less: every row is an [`Item`], a map from
//! attribute name to [`AttrValue`]. Entity modules build items with
//! `insert` and read them back through [`ItemExt`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};

use courier_shared::{AccessMode, DefaultAccess, ObjHeader};

use crate::error::{Result, StoreError};
use crate::schema::{
    ATTR_ACCESS, ATTR_ACCESS_ANON, ATTR_ACCESS_AUTH, ATTR_CREATED_AT, ATTR_DELETED_AT, ATTR_ID,
    ATTR_UPDATED_AT,
};

/// One row of the backing store.
pub type Item = HashMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    S(String),
    /// Numbers travel as decimal strings, as in the backing store.
    N(String),
    B(Vec<u8>),
    Bool(bool),
    Null,
    L(Vec<AttrValue>),
    M(BTreeMap<String, AttrValue>),
    Ss(Vec<String>),
}

impl AttrValue {
    pub fn int(n: i64) -> Self {
        AttrValue::N(n.to_string())
    }

    pub fn time(t: DateTime<Utc>) -> Self {
        AttrValue::S(format_time(t))
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::N(n) => n.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    /// Ordering used for key ranges: strings and binaries compare bytewise,
    /// numbers numerically. Values of different types do not compare.
    pub fn key_cmp(&self, other: &AttrValue) -> Option<Ordering> {
        match (self, other) {
            (AttrValue::S(a), AttrValue::S(b)) => Some(a.cmp(b)),
            (AttrValue::B(a), AttrValue::B(b)) => Some(a.cmp(b)),
            (AttrValue::N(a), AttrValue::N(b)) => match (a.parse::<i64>(), b.parse::<i64>()) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => a.parse::<f64>().ok()?.partial_cmp(&b.parse::<f64>().ok()?),
            },
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::S(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::S(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::int(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(t: DateTime<Utc>) -> Self {
        AttrValue::time(t)
    }
}

impl From<&serde_json::Value> for AttrValue {
    fn from(v: &serde_json::Value) -> Self {
        json_to_attr(v)
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(v: serde_json::Value) -> Self {
        json_to_attr(&v)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 with millisecond precision, so stored timestamps
/// sort the same lexicographically and chronologically.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::codec(format!("bad timestamp {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// JSON blobs
// ---------------------------------------------------------------------------

pub fn json_to_attr(v: &serde_json::Value) -> AttrValue {
    match v {
        serde_json::Value::Null => AttrValue::Null,
        serde_json::Value::Bool(b) => AttrValue::Bool(*b),
        serde_json::Value::Number(n) => AttrValue::N(n.to_string()),
        serde_json::Value::String(s) => AttrValue::S(s.clone()),
        serde_json::Value::Array(arr) => AttrValue::L(arr.iter().map(json_to_attr).collect()),
        serde_json::Value::Object(obj) => AttrValue::M(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_attr(v)))
                .collect(),
        ),
    }
}

pub fn attr_to_json(v: &AttrValue) -> serde_json::Value {
    use serde_json::Value;

    match v {
        AttrValue::S(s) => Value::String(s.clone()),
        AttrValue::N(n) => {
            if let Ok(i) = n.parse::<i64>() {
                Value::Number(i.into())
            } else {
                n.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Null => Value::Null,
        AttrValue::L(list) => Value::Array(list.iter().map(attr_to_json).collect()),
        AttrValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attr_to_json(v)))
                .collect(),
        ),
        AttrValue::Ss(set) => Value::Array(set.iter().cloned().map(Value::String).collect()),
        AttrValue::B(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

// ---------------------------------------------------------------------------
// Reading items
// ---------------------------------------------------------------------------

/// Typed accessors over an [`Item`]. Required getters fail with
/// [`StoreError::Codec`]; optional ones treat a missing or null attribute as
/// absent.
pub trait ItemExt {
    fn attr(&self, name: &str) -> Option<&AttrValue>;

    fn req_s(&self, name: &str) -> Result<String> {
        self.opt_s(name)
            .ok_or_else(|| StoreError::codec(format!("missing string attribute {name}")))
    }

    fn opt_s(&self, name: &str) -> Option<String> {
        self.attr(name).and_then(AttrValue::as_s).map(str::to_string)
    }

    fn int_or_zero(&self, name: &str) -> i64 {
        self.attr(name).and_then(AttrValue::as_i64).unwrap_or(0)
    }

    fn req_i64(&self, name: &str) -> Result<i64> {
        self.attr(name)
            .and_then(AttrValue::as_i64)
            .ok_or_else(|| StoreError::codec(format!("missing numeric attribute {name}")))
    }

    fn opt_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.attr(name) {
            Some(AttrValue::S(s)) => parse_time(s).map(Some),
            Some(AttrValue::Null) | None => Ok(None),
            Some(other) => Err(StoreError::codec(format!(
                "attribute {name} is not a timestamp: {other:?}"
            ))),
        }
    }

    fn time_or_epoch(&self, name: &str) -> Result<DateTime<Utc>> {
        Ok(self.opt_time(name)?.unwrap_or(DateTime::UNIX_EPOCH))
    }

    fn opt_json(&self, name: &str) -> Option<serde_json::Value> {
        match self.attr(name) {
            None | Some(AttrValue::Null) => None,
            Some(v) => Some(attr_to_json(v)),
        }
    }

    fn string_list(&self, name: &str) -> Vec<String> {
        match self.attr(name) {
            Some(AttrValue::Ss(set)) => set.clone(),
            Some(AttrValue::L(list)) => list
                .iter()
                .filter_map(AttrValue::as_s)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl ItemExt for Item {
    fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.get(name)
    }
}

impl ItemExt for BTreeMap<String, AttrValue> {
    fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.get(name)
    }
}

/// Store an optional timestamp, writing `Null` when unset.
pub fn opt_time_attr(t: Option<DateTime<Utc>>) -> AttrValue {
    t.map_or(AttrValue::Null, AttrValue::time)
}

/// Store an optional JSON blob, writing `Null` when unset.
pub fn opt_json_attr(v: Option<&serde_json::Value>) -> AttrValue {
    v.map_or(AttrValue::Null, json_to_attr)
}

// ---------------------------------------------------------------------------
// Shared field groups
// ---------------------------------------------------------------------------

/// Write `Id`, `CreatedAt`, `UpdatedAt` and `DeletedAt`.
pub fn put_header(item: &mut Item, header: &ObjHeader) {
    item.insert(ATTR_ID.to_string(), AttrValue::from(header.id.as_str()));
    item.insert(ATTR_CREATED_AT.to_string(), AttrValue::time(header.created_at));
    item.insert(ATTR_UPDATED_AT.to_string(), AttrValue::time(header.updated_at));
    item.insert(ATTR_DELETED_AT.to_string(), opt_time_attr(header.deleted_at));
}

pub fn read_header(item: &impl ItemExt) -> Result<ObjHeader> {
    Ok(ObjHeader {
        id: item.opt_s(ATTR_ID).unwrap_or_default(),
        created_at: item.time_or_epoch(ATTR_CREATED_AT)?,
        updated_at: item.time_or_epoch(ATTR_UPDATED_AT)?,
        deleted_at: item.opt_time(ATTR_DELETED_AT)?,
    })
}

pub fn access_attr(access: &DefaultAccess) -> AttrValue {
    AttrValue::M(BTreeMap::from([
        (ATTR_ACCESS_AUTH.to_string(), AttrValue::S(access.auth.to_string())),
        (ATTR_ACCESS_ANON.to_string(), AttrValue::S(access.anon.to_string())),
    ]))
}

pub fn read_access(item: &impl ItemExt) -> Result<DefaultAccess> {
    let mode = |map: &BTreeMap<String, AttrValue>, name: &str| -> Result<AccessMode> {
        match map.opt_s(name) {
            Some(s) => Ok(s.parse()?),
            None => Ok(AccessMode::NONE),
        }
    };
    match item.attr(ATTR_ACCESS) {
        Some(AttrValue::M(map)) => Ok(DefaultAccess {
            auth: mode(map, ATTR_ACCESS_AUTH)?,
            anon: mode(map, ATTR_ACCESS_ANON)?,
        }),
        _ => Ok(DefaultAccess::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_json_blob_survives_storage() {
        let blob = json!({"fn": "Alice", "age": 31, "tags": ["a", "b"], "ratio": 0.5, "x": null});
        assert_eq!(attr_to_json(&json_to_attr(&blob)), blob);
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.timestamp_opt(1_000, 0).unwrap();
        let late = Utc.timestamp_opt(1_000_000_000, 5_000_000).unwrap();
        assert!(format_time(early) < format_time(late));
        assert_eq!(format_time(early).len(), format_time(late).len());
        assert_eq!(parse_time(&format_time(late)).unwrap(), late);
    }

    #[test]
    fn test_numeric_key_order() {
        assert_eq!(
            AttrValue::int(9).key_cmp(&AttrValue::int(10)),
            Some(Ordering::Less)
        );
        assert_eq!(AttrValue::int(9).key_cmp(&AttrValue::from("9")), None);
    }

    #[test]
    fn test_missing_required_attribute() {
        let item = Item::new();
        assert!(matches!(item.req_s("Id"), Err(StoreError::Codec(_))));
        assert_eq!(item.int_or_zero("SeqId"), 0);
        assert!(item.opt_time("DeletedAt").unwrap().is_none());
    }
}
