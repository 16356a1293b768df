//! Backend port: the primitives of a key/secondary-index store.
//!
//! The store offers single-item conditional writes, fixed-size batch
//! operations and cursor-paginated range queries, and nothing else. All
//! cross-entity semantics are built on top of these in the entity modules.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::item::{AttrValue, Item};
use crate::schema::TableSchema;

pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use memory::MemoryBackend;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoBackend;

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Existence requirement checked atomically with a single-item write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    MustNotExist,
    MustExist,
}

/// A top-level attribute, optionally narrowed to one key of a map attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrPath {
    pub attr: String,
    pub key: Option<String>,
}

impl AttrPath {
    pub fn attr(name: impl Into<String>) -> Self {
        Self {
            attr: name.into(),
            key: None,
        }
    }

    pub fn map_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            attr: name.into(),
            key: Some(key.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set(AttrPath, AttrValue),
    Remove(AttrPath),
    /// Append to a list attribute, creating it when absent.
    Append(AttrPath, Vec<AttrValue>),
}

/// Field-level partial update: attribute name to new value.
///
/// Names are passed through verbatim, so callers may set attributes the
/// entity model does not know about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    fields: BTreeMap<String, AttrValue>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<AttrValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&AttrValue> {
        self.fields.get(field)
    }

    pub fn into_actions(self) -> Vec<UpdateAction> {
        self.fields
            .into_iter()
            .map(|(field, value)| UpdateAction::Set(AttrPath::attr(field), value))
            .collect()
    }
}

impl From<BTreeMap<String, AttrValue>> for Patch {
    fn from(fields: BTreeMap<String, AttrValue>) -> Self {
        Self { fields }
    }
}

impl From<&serde_json::Map<String, serde_json::Value>> for Patch {
    fn from(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            fields: map.iter().map(|(k, v)| (k.clone(), AttrValue::from(v))).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(Item),
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Post-read filter. Evaluated after `limit` has been applied, so a page may
/// come back short (or empty) while a cursor is still present.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Attribute missing or null.
    Absent(String),
    NotEqual(String, AttrValue),
    All(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::Absent(attr) => item.get(attr).map_or(true, AttrValue::is_null),
            Filter::NotEqual(attr, value) => item.get(attr) != Some(value),
            Filter::All(filters) => filters.iter().all(|f| f.matches(item)),
        }
    }
}

/// Inclusive bounds on the sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct SortRange {
    pub attr: String,
    pub low: AttrValue,
    pub high: AttrValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub table: String,
    pub index: Option<String>,
    pub partition: (String, AttrValue),
    pub range: Option<SortRange>,
    pub descending: bool,
    pub limit: Option<usize>,
    pub filter: Option<Filter>,
    pub projection: Option<Vec<String>>,
    pub exclusive_start_key: Option<Item>,
}

impl QueryRequest {
    pub fn new(table: impl Into<String>, attr: &str, value: impl Into<AttrValue>) -> Self {
        Self {
            table: table.into(),
            index: None,
            partition: (attr.to_string(), value.into()),
            range: None,
            descending: false,
            limit: None,
            filter: None,
            projection: None,
            exclusive_start_key: None,
        }
    }

    pub fn index(mut self, name: &str) -> Self {
        self.index = Some(name.to_string());
        self
    }

    pub fn between(mut self, attr: &str, low: AttrValue, high: AttrValue) -> Self {
        self.range = Some(SortRange {
            attr: attr.to_string(),
            low,
            high,
        });
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn project(mut self, attrs: &[&str]) -> Self {
        self.projection = Some(attrs.iter().map(|a| a.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutput {
    pub items: Vec<Item>,
    /// Keys the backend did not get to; the caller re-submits them.
    pub unprocessed: Vec<Item>,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Backing-store contract.
///
/// A failed [`Precondition`] is reported as [`StoreError::Conflict`]; every
/// other failure as [`StoreError::Backend`]. Implementations do not retry.
///
/// [`StoreError::Conflict`]: crate::error::StoreError::Conflict
/// [`StoreError::Backend`]: crate::error::StoreError::Backend
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_item(
        &self,
        table: &str,
        key: &Item,
        projection: Option<&[String]>,
    ) -> Result<Option<Item>>;

    async fn put_item(&self, table: &str, item: Item, cond: Precondition) -> Result<()>;

    async fn update_item(
        &self,
        table: &str,
        key: &Item,
        actions: Vec<UpdateAction>,
        cond: Precondition,
    ) -> Result<()>;

    async fn delete_item(&self, table: &str, key: &Item, cond: Precondition) -> Result<()>;

    /// At most [`MAX_BATCH_GET_ITEMS`](crate::schema::MAX_BATCH_GET_ITEMS)
    /// keys per call.
    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Item>,
        projection: Option<&[String]>,
    ) -> Result<BatchGetOutput>;

    /// At most [`MAX_BATCH_WRITE_ITEMS`](crate::schema::MAX_BATCH_WRITE_ITEMS)
    /// requests per call. Returns the requests left unprocessed.
    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage>;

    /// Returns `false` if the table already existed.
    async fn create_table(&self, schema: &TableSchema) -> Result<bool>;

    /// Returns `false` if the table did not exist.
    async fn delete_table(&self, name: &str) -> Result<bool>;

    /// Enabling TTL on a table that already has it is not an error.
    async fn enable_ttl(&self, table: &str, attr: &str) -> Result<()>;
}

/// Human-readable rendering of a key for error messages and logs.
pub fn describe_key(key: &Item) -> String {
    let mut parts: Vec<String> = key
        .iter()
        .map(|(name, value)| match value {
            AttrValue::S(s) => format!("{name}={s}"),
            AttrValue::N(n) => format!("{name}={n}"),
            other => format!("{name}={other:?}"),
        })
        .collect();
    parts.sort();
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_semantics() {
        let item = Item::from([
            ("DeletedAt".to_string(), AttrValue::Null),
            ("User".to_string(), AttrValue::from("alice")),
        ]);
        assert!(Filter::Absent("DeletedAt".into()).matches(&item));
        assert!(Filter::Absent("Missing".into()).matches(&item));
        assert!(!Filter::Absent("User".into()).matches(&item));

        let not_alice = Filter::NotEqual("User".into(), AttrValue::from("alice"));
        assert!(!not_alice.matches(&item));
        assert!(!Filter::All(vec![Filter::Absent("DeletedAt".into()), not_alice]).matches(&item));
    }

    #[test]
    fn test_patch_from_json_passes_unknown_fields() {
        let map = json!({"Public": {"fn": "Bob"}, "Custom": 7});
        let patch = Patch::from(map.as_object().unwrap());
        assert!(patch.contains("Custom"));
        let actions = patch.into_actions();
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&UpdateAction::Set(
            AttrPath::attr("Custom"),
            AttrValue::int(7)
        )));
    }

    #[test]
    fn test_describe_key_is_sorted() {
        let key = Item::from([
            ("Topic".to_string(), AttrValue::from("grp1")),
            ("SeqId".to_string(), AttrValue::int(3)),
        ]);
        assert_eq!(describe_key(&key), "SeqId=3,Topic=grp1");
    }
}
