//! In-process backend.
//!
//! Behaves like the hosted store in every way the adapter depends on:
//! conditional writes, batch size limits, unprocessed keys, limit-before-filter
//! queries and cursor pagination. Page size, batch capacity and injected
//! failures are configurable so the executors can be exercised
//! deterministically.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{
    describe_key, Backend, BatchGetOutput, Precondition, QueryPage, QueryRequest, UpdateAction,
    WriteRequest,
};
use crate::error::{Result, StoreError};
use crate::item::{AttrValue, Item};
use crate::schema::{KeyLayout, KeyType, TableSchema, MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS};

/// Default number of items a single query evaluates before returning a cursor.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

struct MemTable {
    schema: TableSchema,
    rows: HashMap<String, Item>,
    ttl_attr: Option<String>,
}

impl MemTable {
    fn row_id(&self, key: &Item) -> Result<String> {
        row_id(&self.schema.key, key)
    }

    fn check(&self, exists: bool, cond: Precondition, key: &Item) -> Result<()> {
        let ok = match cond {
            Precondition::None => true,
            Precondition::MustNotExist => !exists,
            Precondition::MustExist => exists,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                table: self.schema.name.clone(),
                key: describe_key(key),
            })
        }
    }
}

pub struct MemoryBackend {
    tables: RwLock<HashMap<String, MemTable>>,
    page_size: usize,
    batch_capacity: Option<usize>,
    poisoned: RwLock<HashSet<String>>,
    query_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            batch_capacity: None,
            poisoned: RwLock::new(HashSet::new()),
            query_calls: AtomicUsize::new(0),
        }
    }

    /// Cap the number of items one query call evaluates.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Process at most `capacity` keys per batch call and report the rest as
    /// unprocessed.
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = Some(capacity);
        self
    }

    /// Fail every request whose key or partition carries the string `value`.
    pub async fn fail_on(&self, value: impl Into<String>) {
        self.poisoned.write().await.insert(value.into());
    }

    pub async fn clear_failures(&self) {
        self.poisoned.write().await.clear();
    }

    /// Number of query calls served so far.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(AtomicOrdering::Relaxed)
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub async fn ttl_attr(&self, table: &str) -> Option<String> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|t| t.ttl_attr.clone())
    }

    async fn check_poison<'a>(&self, values: impl IntoIterator<Item = &'a AttrValue>) -> Result<()> {
        let poisoned = self.poisoned.read().await;
        if poisoned.is_empty() {
            return Ok(());
        }
        for value in values {
            if let AttrValue::S(s) = value {
                if poisoned.contains(s) {
                    return Err(StoreError::Backend(format!("injected failure on {s}")));
                }
            }
        }
        Ok(())
    }
}

fn missing_table(name: &str) -> StoreError {
    StoreError::Backend(format!("requested resource not found: table {name}"))
}

/// Canonical string for the key attributes of `item` under `layout`.
fn row_id(layout: &KeyLayout, item: &Item) -> Result<String> {
    let mut id = String::new();
    for attr in [Some(layout.hash), layout.range].into_iter().flatten() {
        let value = item
            .get(attr.name)
            .ok_or_else(|| StoreError::Backend(format!("missing key attribute {}", attr.name)))?;
        match (attr.key_type, value) {
            (KeyType::S, AttrValue::S(s)) => id.push_str(s),
            (KeyType::N, AttrValue::N(_)) => {
                let n = value.as_i64().ok_or_else(|| {
                    StoreError::Backend(format!("bad numeric key attribute {}", attr.name))
                })?;
                id.push_str(&n.to_string());
            }
            _ => {
                return Err(StoreError::Backend(format!(
                    "key attribute {} has the wrong type",
                    attr.name
                )))
            }
        }
        id.push('\u{1f}');
    }
    Ok(id)
}

fn project(item: &Item, projection: Option<&[String]>) -> Item {
    match projection {
        None => item.clone(),
        Some(attrs) => attrs
            .iter()
            .filter_map(|a| item.get(a).map(|v| (a.clone(), v.clone())))
            .collect(),
    }
}

fn apply(item: &mut Item, action: UpdateAction) -> Result<()> {
    let invalid_path = |attr: &str| {
        StoreError::Backend(format!(
            "the document path provided in the update expression is invalid: {attr}"
        ))
    };

    match action {
        UpdateAction::Set(path, value) => match path.key {
            None => {
                item.insert(path.attr, value);
            }
            Some(key) => match item.get_mut(&path.attr) {
                Some(AttrValue::M(map)) => {
                    map.insert(key, value);
                }
                _ => return Err(invalid_path(&path.attr)),
            },
        },
        UpdateAction::Remove(path) => match path.key {
            None => {
                item.remove(&path.attr);
            }
            Some(key) => {
                if let Some(AttrValue::M(map)) = item.get_mut(&path.attr) {
                    map.remove(&key);
                }
            }
        },
        UpdateAction::Append(path, values) => {
            let slot = match path.key {
                None => item.entry(path.attr.clone()).or_insert(AttrValue::Null),
                Some(key) => match item.get_mut(&path.attr) {
                    Some(AttrValue::M(map)) => map.entry(key).or_insert(AttrValue::Null),
                    _ => return Err(invalid_path(&path.attr)),
                },
            };
            match slot {
                AttrValue::L(list) => list.extend(values),
                AttrValue::Null => *slot = AttrValue::L(values),
                _ => return Err(invalid_path(&path.attr)),
            }
        }
    }
    Ok(())
}

/// Ordering of query results: sort key first, then primary key so the order
/// is total even on hash-only indexes.
fn result_order(index: &KeyLayout, primary: &KeyLayout, a: &Item, b: &Item) -> Ordering {
    let by_range = index
        .range
        .and_then(|r| {
            let (x, y) = (a.get(r.name)?, b.get(r.name)?);
            x.key_cmp(y)
        })
        .unwrap_or(Ordering::Equal);
    by_range.then_with(|| {
        let x = row_id(primary, a).unwrap_or_default();
        let y = row_id(primary, b).unwrap_or_default();
        x.cmp(&y)
    })
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_item(
        &self,
        table: &str,
        key: &Item,
        projection: Option<&[String]>,
    ) -> Result<Option<Item>> {
        self.check_poison(key.values()).await?;
        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| missing_table(table))?;
        let id = t.row_id(key)?;
        Ok(t.rows.get(&id).map(|item| project(item, projection)))
    }

    async fn put_item(&self, table: &str, item: Item, cond: Precondition) -> Result<()> {
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let key = t.schema.key.extract(&item);
        self.check_poison(key.values()).await?;
        let id = t.row_id(&key)?;
        t.check(t.rows.contains_key(&id), cond, &key)?;
        t.rows.insert(id, item);
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: &Item,
        actions: Vec<UpdateAction>,
        cond: Precondition,
    ) -> Result<()> {
        self.check_poison(key.values()).await?;
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let id = t.row_id(key)?;
        t.check(t.rows.contains_key(&id), cond, key)?;

        // Work on a copy so a failing action leaves the row untouched.
        let mut item = t.rows.get(&id).cloned().unwrap_or_else(|| key.clone());
        for action in actions {
            apply(&mut item, action)?;
        }
        t.rows.insert(id, item);
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: &Item, cond: Precondition) -> Result<()> {
        self.check_poison(key.values()).await?;
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let id = t.row_id(key)?;
        t.check(t.rows.contains_key(&id), cond, key)?;
        t.rows.remove(&id);
        Ok(())
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Item>,
        projection: Option<&[String]>,
    ) -> Result<BatchGetOutput> {
        if keys.is_empty() || keys.len() > MAX_BATCH_GET_ITEMS {
            return Err(StoreError::Backend(format!(
                "batch get accepts 1..={MAX_BATCH_GET_ITEMS} keys, got {}",
                keys.len()
            )));
        }
        self.check_poison(keys.iter().flat_map(|k| k.values())).await?;

        let tables = self.tables.read().await;
        let t = tables.get(table).ok_or_else(|| missing_table(table))?;

        let take = self.batch_capacity.unwrap_or(keys.len()).min(keys.len());
        let mut keys = keys;
        let unprocessed = keys.split_off(take);

        let mut items = Vec::new();
        for key in &keys {
            if let Some(item) = t.rows.get(&t.row_id(key)?) {
                items.push(project(item, projection));
            }
        }
        Ok(BatchGetOutput { items, unprocessed })
    }

    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>> {
        if requests.is_empty() || requests.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(StoreError::Backend(format!(
                "batch write accepts 1..={MAX_BATCH_WRITE_ITEMS} requests, got {}",
                requests.len()
            )));
        }

        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        let take = self.batch_capacity.unwrap_or(requests.len()).min(requests.len());
        let mut requests = requests;
        let unprocessed = requests.split_off(take);

        for request in requests {
            match request {
                WriteRequest::Put(item) => {
                    let key = t.schema.key.extract(&item);
                    self.check_poison(key.values()).await?;
                    let id = t.row_id(&key)?;
                    t.rows.insert(id, item);
                }
                WriteRequest::Delete(key) => {
                    self.check_poison(key.values()).await?;
                    let id = t.row_id(&key)?;
                    t.rows.remove(&id);
                }
            }
        }
        Ok(unprocessed)
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        self.query_calls.fetch_add(1, AtomicOrdering::Relaxed);
        self.check_poison([&request.partition.1]).await?;
        if request.limit == Some(0) {
            return Err(StoreError::Backend("limit must be at least 1".to_string()));
        }

        let tables = self.tables.read().await;
        let t = tables
            .get(&request.table)
            .ok_or_else(|| missing_table(&request.table))?;
        let primary = t.schema.key;
        let layout = match &request.index {
            None => primary,
            Some(name) => {
                t.schema
                    .index(name)
                    .ok_or_else(|| StoreError::Backend(format!("no index {name} on {}", t.schema.name)))?
                    .key
            }
        };

        let (hash_attr, hash_value) = &request.partition;
        if layout.hash.name != hash_attr {
            return Err(StoreError::Backend(format!(
                "query condition must name the hash key {}",
                layout.hash.name
            )));
        }
        if let Some(range) = &request.range {
            if layout.range.map(|r| r.name) != Some(range.attr.as_str()) {
                return Err(StoreError::Backend(format!(
                    "query range must name the sort key, got {}",
                    range.attr
                )));
            }
        }

        let mut rows: Vec<&Item> = t
            .rows
            .values()
            .filter(|item| item.get(hash_attr) == Some(hash_value))
            // Items without the index sort key are not projected into the index.
            .filter(|item| layout.range.map_or(true, |r| item.contains_key(r.name)))
            .filter(|item| match &request.range {
                None => true,
                Some(range) => item.get(&range.attr).map_or(false, |v| {
                    v.key_cmp(&range.low).map_or(false, |o| o != Ordering::Less)
                        && v.key_cmp(&range.high).map_or(false, |o| o != Ordering::Greater)
                }),
            })
            .collect();

        rows.sort_by(|a, b| result_order(&layout, &primary, a, b));
        if request.descending {
            rows.reverse();
        }

        if let Some(start) = &request.exclusive_start_key {
            let past = if request.descending {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            rows.retain(|item| result_order(&layout, &primary, item, start) == past);
        }

        let cap = request.limit.unwrap_or(usize::MAX).min(self.page_size);
        let more = rows.len() > cap;
        rows.truncate(cap);

        let last_evaluated_key = match rows.last() {
            Some(last) if more => {
                let mut key = primary.extract(last);
                key.extend(layout.extract(last));
                Some(key)
            }
            _ => None,
        };

        let items = rows
            .into_iter()
            .filter(|item| request.filter.as_ref().map_or(true, |f| f.matches(item)))
            .map(|item| project(item, request.projection.as_deref()))
            .collect();

        Ok(QueryPage {
            items,
            last_evaluated_key,
        })
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(&schema.name) {
            return Ok(false);
        }
        tables.insert(
            schema.name.clone(),
            MemTable {
                schema: schema.clone(),
                rows: HashMap::new(),
                ttl_attr: None,
            },
        );
        Ok(true)
    }

    async fn delete_table(&self, name: &str) -> Result<bool> {
        Ok(self.tables.write().await.remove(name).is_some())
    }

    async fn enable_ttl(&self, table: &str, attr: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        t.ttl_attr = Some(attr.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttrPath, Filter};
    use crate::config::StoreConfig;
    use crate::schema::{self, table_schemas, Table};

    async fn backend_with_tables(backend: MemoryBackend) -> MemoryBackend {
        for schema in table_schemas(&StoreConfig::default()) {
            backend.create_table(&schema).await.unwrap();
        }
        backend
    }

    fn table_name(table: Table) -> String {
        table_schemas(&StoreConfig::default())
            .into_iter()
            .find(|s| s.table == table)
            .map(|s| s.name)
            .unwrap()
    }

    fn message(topic: &str, seq: i64) -> Item {
        let mut item = schema::message_key(topic, seq);
        item.insert("From".to_string(), AttrValue::from("u1"));
        item
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let backend = backend_with_tables(MemoryBackend::new()).await;
        let users = table_name(Table::Users);
        let item = schema::topic_key("abc");

        backend
            .put_item(&users, item.clone(), Precondition::MustNotExist)
            .await
            .unwrap();
        let err = backend
            .put_item(&users, item.clone(), Precondition::MustNotExist)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let missing = schema::topic_key("nope");
        let err = backend
            .delete_item(&users, &missing, Precondition::MustExist)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_table_is_idempotent() {
        let backend = backend_with_tables(MemoryBackend::new()).await;
        let schemas = table_schemas(&StoreConfig::default());
        assert!(!backend.create_table(&schemas[0]).await.unwrap());
        assert!(backend.delete_table(&schemas[0].name).await.unwrap());
        assert!(!backend.delete_table(&schemas[0].name).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_pages_with_cursor() {
        let backend = backend_with_tables(MemoryBackend::new().with_page_size(4)).await;
        let messages = table_name(Table::Messages);
        for seq in 1..=10 {
            backend
                .put_item(&messages, message("grp1", seq), Precondition::None)
                .await
                .unwrap();
        }

        let mut request = QueryRequest::new(&messages, schema::ATTR_TOPIC, "grp1")
            .between(schema::ATTR_SEQ_ID, AttrValue::int(2), AttrValue::int(9))
            .descending();
        let mut seen = Vec::new();
        loop {
            let page = backend.query(&request).await.unwrap();
            seen.extend(page.items.iter().map(|i| i[schema::ATTR_SEQ_ID].as_i64().unwrap()));
            match page.last_evaluated_key {
                Some(key) => request.exclusive_start_key = Some(key),
                None => break,
            }
        }
        assert_eq!(seen, vec![9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(backend.query_calls(), 2);
    }

    #[tokio::test]
    async fn test_limit_applies_before_filter() {
        let backend = backend_with_tables(MemoryBackend::new()).await;
        let messages = table_name(Table::Messages);
        for seq in 1..=4 {
            let mut item = message("grp1", seq);
            if seq <= 2 {
                item.insert(schema::ATTR_DELETED_AT.to_string(), AttrValue::from("x"));
            }
            backend.put_item(&messages, item, Precondition::None).await.unwrap();
        }
        let request = QueryRequest::new(&messages, schema::ATTR_TOPIC, "grp1")
            .limit(2)
            .filter(Filter::Absent(schema::ATTR_DELETED_AT.to_string()));
        let page = backend.query(&request).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn test_batch_limits_and_unprocessed() {
        let backend = backend_with_tables(MemoryBackend::new().with_batch_capacity(2)).await;
        let topics = table_name(Table::Topics);
        let keys: Vec<Item> = (0..5).map(|i| schema::topic_key(&format!("t{i}"))).collect();
        let out = backend.batch_get(&topics, keys, None).await.unwrap();
        assert_eq!(out.unprocessed.len(), 3);

        let too_many: Vec<Item> = (0..101).map(|i| schema::topic_key(&format!("t{i}"))).collect();
        assert!(matches!(
            backend.batch_get(&topics, too_many, None).await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_update_actions() {
        let backend = backend_with_tables(MemoryBackend::new()).await;
        let users = table_name(Table::Users);
        let key = schema::topic_key("u1");

        // Setting inside a missing map is rejected and leaves nothing behind.
        let err = backend
            .update_item(
                &users,
                &key,
                vec![UpdateAction::Set(AttrPath::map_key("Devices", "h"), AttrValue::Null)],
                Precondition::None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(backend.get_item(&users, &key, None).await.unwrap().is_none());

        backend
            .update_item(
                &users,
                &key,
                vec![
                    UpdateAction::Set(AttrPath::attr("Devices"), AttrValue::M(Default::default())),
                    UpdateAction::Append(AttrPath::attr("DeletedFor"), vec![AttrValue::from("a")]),
                ],
                Precondition::None,
            )
            .await
            .unwrap();
        backend
            .update_item(
                &users,
                &key,
                vec![UpdateAction::Append(
                    AttrPath::attr("DeletedFor"),
                    vec![AttrValue::from("b")],
                )],
                Precondition::MustExist,
            )
            .await
            .unwrap();

        let item = backend.get_item(&users, &key, None).await.unwrap().unwrap();
        assert_eq!(
            item["DeletedFor"],
            AttrValue::L(vec![AttrValue::from("a"), AttrValue::from("b")])
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = backend_with_tables(MemoryBackend::new()).await;
        let topics = table_name(Table::Topics);
        backend.fail_on("bad").await;
        let err = backend
            .get_item(&topics, &schema::topic_key("bad"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        backend.clear_failures().await;
        assert!(backend
            .get_item(&topics, &schema::topic_key("bad"), None)
            .await
            .unwrap()
            .is_none());
    }
}
