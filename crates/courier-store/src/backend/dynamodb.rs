//! Amazon DynamoDB backend.
//!
//! Every request is built with placeholder attribute names (`#n0`, `#n1`,
//! ...) and values (`:v0`, `:v1`, ...), so attribute names that collide
//! with DynamoDB reserved words need no special handling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::create_table::CreateTableError;
use aws_sdk_dynamodb::operation::delete_table::DeleteTableError;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{self as ddb, AttributeValue};
use aws_sdk_dynamodb::Client;

use crate::config::{StoreConfig, Throughput};
use crate::error::{Result, StoreError};
use crate::item::{AttrValue, Item};
use crate::schema::{table_schemas, KeyAttr, KeyLayout, KeyType, TableSchema};

use super::{
    describe_key, AttrPath, Backend, BatchGetOutput, Filter, Precondition, QueryPage,
    QueryRequest, UpdateAction, WriteRequest,
};

type RawItem = HashMap<String, AttributeValue>;

/// Polls of `DescribeTable` while waiting for a table to settle.
const TABLE_ACTIVE_POLLS: u32 = 60;
const TABLE_ACTIVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct DynamoBackend {
    client: Client,
    /// Primary key layout per physical table name.
    keys: HashMap<String, KeyLayout>,
}

impl std::fmt::Debug for DynamoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoBackend")
            .field("tables", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DynamoBackend {
    /// Load AWS settings from the environment, then apply the region,
    /// profile and endpoint overrides from `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;
        Ok(Self::new(&sdk_config, config))
    }

    pub fn new(sdk_config: &aws_config::SdkConfig, config: &StoreConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::from_client(Client::from_conf(builder.build()), config)
    }

    /// Wrap a pre-built client.
    pub fn from_client(client: Client, config: &StoreConfig) -> Self {
        let keys = table_schemas(config)
            .into_iter()
            .map(|schema| (schema.name, schema.key))
            .collect();
        Self { client, keys }
    }

    fn key_layout(&self, table: &str) -> Result<&KeyLayout> {
        self.keys
            .get(table)
            .ok_or_else(|| StoreError::Backend(format!("unknown table {table}")))
    }

    async fn wait_until_active(&self, table: &str) -> Result<()> {
        for _ in 0..TABLE_ACTIVE_POLLS {
            let out = self
                .client
                .describe_table()
                .table_name(table)
                .send()
                .await
                .map_err(|e| sdk_err("DescribeTable", table, e))?;
            let status = out.table.and_then(|t| t.table_status);
            if status == Some(ddb::TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(TABLE_ACTIVE_INTERVAL).await;
        }
        Err(StoreError::Backend(format!("table {table} did not become active")))
    }

    async fn wait_until_gone(&self, table: &str) -> Result<()> {
        for _ in 0..TABLE_ACTIVE_POLLS {
            let result = self.client.describe_table().table_name(table).send().await;
            match result {
                Ok(_) => tokio::time::sleep(TABLE_ACTIVE_INTERVAL).await,
                Err(e) if e.as_service_error().map_or(false, |e| e.is_resource_not_found_exception()) => {
                    return Ok(());
                }
                Err(e) => return Err(sdk_err("DescribeTable", table, e)),
            }
        }
        Err(StoreError::Backend(format!("table {table} was not deleted")))
    }
}

#[async_trait]
impl Backend for DynamoBackend {
    async fn get_item(
        &self,
        table: &str,
        key: &Item,
        projection: Option<&[String]>,
    ) -> Result<Option<Item>> {
        let mut expr = Expr::default();
        let projection = projection.map(|attrs| expr.projection(attrs));
        let out = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(to_raw(key)))
            .set_projection_expression(projection)
            .set_expression_attribute_names(expr.names())
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| sdk_err("GetItem", table, e))?;
        out.item.map(from_raw).transpose()
    }

    async fn put_item(&self, table: &str, item: Item, cond: Precondition) -> Result<()> {
        let layout = self.key_layout(table)?;
        let key = layout.extract(&item);
        let mut expr = Expr::default();
        let condition = expr.precondition(layout, cond);
        let result = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(to_raw(&item)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_condition_failure(&e) => Err(conflict(table, &key)),
            Err(e) => Err(sdk_err("PutItem", table, e)),
        }
    }

    async fn update_item(
        &self,
        table: &str,
        key: &Item,
        actions: Vec<UpdateAction>,
        cond: Precondition,
    ) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let layout = self.key_layout(table)?;
        let mut expr = Expr::default();
        let update = expr.update(actions);
        let condition = expr.precondition(layout, cond);
        let result = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(to_raw(key)))
            .update_expression(update)
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_condition_failure(&e) => Err(conflict(table, key)),
            Err(e) => Err(sdk_err("UpdateItem", table, e)),
        }
    }

    async fn delete_item(&self, table: &str, key: &Item, cond: Precondition) -> Result<()> {
        let layout = self.key_layout(table)?;
        let mut expr = Expr::default();
        let condition = expr.precondition(layout, cond);
        let result = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(to_raw(key)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(expr.names())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_condition_failure(&e) => Err(conflict(table, key)),
            Err(e) => Err(sdk_err("DeleteItem", table, e)),
        }
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Item>,
        projection: Option<&[String]>,
    ) -> Result<BatchGetOutput> {
        let mut expr = Expr::default();
        let projection = projection.map(|attrs| expr.projection(attrs));
        let request = ddb::KeysAndAttributes::builder()
            .set_keys(Some(keys.iter().map(to_raw).collect()))
            .set_projection_expression(projection)
            .set_expression_attribute_names(expr.names())
            .build()
            .map_err(build_err)?;
        let out = self
            .client
            .batch_get_item()
            .request_items(table, request)
            .send()
            .await
            .map_err(|e| sdk_err("BatchGetItem", table, e))?;

        let items = out
            .responses
            .and_then(|mut r| r.remove(table))
            .unwrap_or_default()
            .into_iter()
            .map(from_raw)
            .collect::<Result<_>>()?;
        let unprocessed = out
            .unprocessed_keys
            .and_then(|mut u| u.remove(table))
            .map(|k| k.keys)
            .unwrap_or_default()
            .into_iter()
            .map(from_raw)
            .collect::<Result<_>>()?;
        Ok(BatchGetOutput { items, unprocessed })
    }

    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<Vec<WriteRequest>> {
        let requests = requests
            .iter()
            .map(to_raw_write)
            .collect::<Result<Vec<_>>>()?;
        let out = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| sdk_err("BatchWriteItem", table, e))?;

        out.unprocessed_items
            .and_then(|mut u| u.remove(table))
            .unwrap_or_default()
            .into_iter()
            .map(from_raw_write)
            .collect()
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        let mut expr = Expr::default();
        let (attr, value) = &request.partition;
        let mut key_condition = format!("{} = {}", expr.name(attr), expr.value(value.clone()));
        if let Some(range) = &request.range {
            key_condition = format!(
                "{key_condition} AND {} BETWEEN {} AND {}",
                expr.name(&range.attr),
                expr.value(range.low.clone()),
                expr.value(range.high.clone()),
            );
        }
        let filter = request.filter.as_ref().map(|f| expr.filter(f));
        let projection = request.projection.as_deref().map(|attrs| expr.projection(attrs));
        let limit = request
            .limit
            .map(|n| i32::try_from(n).unwrap_or(i32::MAX));

        let out = self
            .client
            .query()
            .table_name(&request.table)
            .set_index_name(request.index.clone())
            .key_condition_expression(key_condition)
            .set_filter_expression(filter)
            .set_projection_expression(projection)
            .set_expression_attribute_names(expr.names())
            .set_expression_attribute_values(expr.values())
            .scan_index_forward(!request.descending)
            .set_limit(limit)
            .set_exclusive_start_key(request.exclusive_start_key.as_ref().map(to_raw))
            .send()
            .await
            .map_err(|e| sdk_err("Query", &request.table, e))?;

        let items = out
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_raw)
            .collect::<Result<_>>()?;
        let last_evaluated_key = out
            .last_evaluated_key
            .filter(|k| !k.is_empty())
            .map(from_raw)
            .transpose()?;
        Ok(QueryPage {
            items,
            last_evaluated_key,
        })
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<bool> {
        let mut attrs: Vec<KeyAttr> = key_attrs(&schema.key).collect();
        for index in &schema.indexes {
            for attr in key_attrs(&index.key) {
                if !attrs.iter().any(|a| a.name == attr.name) {
                    attrs.push(attr);
                }
            }
        }
        let definitions = attrs
            .iter()
            .map(|a| {
                ddb::AttributeDefinition::builder()
                    .attribute_name(a.name)
                    .attribute_type(match a.key_type {
                        KeyType::S => ddb::ScalarAttributeType::S,
                        KeyType::N => ddb::ScalarAttributeType::N,
                    })
                    .build()
                    .map_err(build_err)
            })
            .collect::<Result<Vec<_>>>()?;
        let indexes = schema
            .indexes
            .iter()
            .map(|index| {
                ddb::GlobalSecondaryIndex::builder()
                    .index_name(index.name)
                    .set_key_schema(Some(key_schema(&index.key)?))
                    .projection(
                        ddb::Projection::builder()
                            .projection_type(ddb::ProjectionType::All)
                            .build(),
                    )
                    .provisioned_throughput(throughput(index.throughput)?)
                    .build()
                    .map_err(build_err)
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .create_table()
            .table_name(&schema.name)
            .set_attribute_definitions(Some(definitions))
            .set_key_schema(Some(key_schema(&schema.key)?))
            .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
            .provisioned_throughput(throughput(schema.throughput)?)
            .send()
            .await;
        match result {
            Ok(_) => {}
            Err(e) if matches!(e.as_service_error(), Some(CreateTableError::ResourceInUseException(_))) => {
                return Ok(false);
            }
            Err(e) => return Err(sdk_err("CreateTable", &schema.name, e)),
        }
        self.wait_until_active(&schema.name).await?;
        Ok(true)
    }

    async fn delete_table(&self, name: &str) -> Result<bool> {
        let result = self.client.delete_table().table_name(name).send().await;
        match result {
            Ok(_) => {}
            Err(e) if matches!(e.as_service_error(), Some(DeleteTableError::ResourceNotFoundException(_))) => {
                return Ok(false);
            }
            Err(e) => return Err(sdk_err("DeleteTable", name, e)),
        }
        self.wait_until_gone(name).await?;
        Ok(true)
    }

    async fn enable_ttl(&self, table: &str, attr: &str) -> Result<()> {
        let current = self
            .client
            .describe_time_to_live()
            .table_name(table)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeTimeToLive", table, e))?;
        if let Some(desc) = current.time_to_live_description {
            let enabled = matches!(
                desc.time_to_live_status,
                Some(ddb::TimeToLiveStatus::Enabled | ddb::TimeToLiveStatus::Enabling)
            );
            if enabled && desc.attribute_name.as_deref() == Some(attr) {
                return Ok(());
            }
        }

        let spec = ddb::TimeToLiveSpecification::builder()
            .enabled(true)
            .attribute_name(attr)
            .build()
            .map_err(build_err)?;
        self.client
            .update_time_to_live()
            .table_name(table)
            .time_to_live_specification(spec)
            .send()
            .await
            .map_err(|e| sdk_err("UpdateTimeToLive", table, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Placeholder registry for one request.
#[derive(Default)]
struct Expr {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Expr {
    fn name(&mut self, attr: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, a)| *a == attr) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    fn value(&mut self, value: AttrValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), to_aws(&value));
        placeholder
    }

    fn path(&mut self, path: &AttrPath) -> String {
        let attr = self.name(&path.attr);
        match &path.key {
            Some(key) => format!("{attr}.{}", self.name(key)),
            None => attr,
        }
    }

    fn precondition(&mut self, layout: &KeyLayout, cond: Precondition) -> Option<String> {
        match cond {
            Precondition::None => None,
            Precondition::MustNotExist => {
                Some(format!("attribute_not_exists({})", self.name(layout.hash.name)))
            }
            Precondition::MustExist => {
                Some(format!("attribute_exists({})", self.name(layout.hash.name)))
            }
        }
    }

    fn update(&mut self, actions: Vec<UpdateAction>) -> String {
        let mut set = Vec::new();
        let mut remove = Vec::new();
        for action in actions {
            match action {
                UpdateAction::Set(path, value) => {
                    let path = self.path(&path);
                    set.push(format!("{path} = {}", self.value(value)));
                }
                UpdateAction::Remove(path) => remove.push(self.path(&path)),
                UpdateAction::Append(path, values) => {
                    let path = self.path(&path);
                    let empty = self.value(AttrValue::L(Vec::new()));
                    let tail = self.value(AttrValue::L(values));
                    set.push(format!(
                        "{path} = list_append(if_not_exists({path}, {empty}), {tail})"
                    ));
                }
            }
        }

        let mut clauses = Vec::new();
        if !set.is_empty() {
            clauses.push(format!("SET {}", set.join(", ")));
        }
        if !remove.is_empty() {
            clauses.push(format!("REMOVE {}", remove.join(", ")));
        }
        clauses.join(" ")
    }

    fn filter(&mut self, filter: &Filter) -> String {
        match filter {
            Filter::Absent(attr) => {
                let name = self.name(attr);
                let null = self.value(AttrValue::from("NULL"));
                format!("(attribute_not_exists({name}) OR attribute_type({name}, {null}))")
            }
            Filter::NotEqual(attr, value) => {
                let name = self.name(attr);
                let value = self.value(value.clone());
                format!("(attribute_not_exists({name}) OR {name} <> {value})")
            }
            Filter::All(filters) => {
                let parts: Vec<String> = filters.iter().map(|f| self.filter(f)).collect();
                format!("({})", parts.join(" AND "))
            }
        }
    }

    fn projection(&mut self, attrs: &[String]) -> String {
        attrs
            .iter()
            .map(|a| self.name(a))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn names(&self) -> Option<HashMap<String, String>> {
        (!self.names.is_empty()).then(|| self.names.clone())
    }

    fn values(&self) -> Option<HashMap<String, AttributeValue>> {
        (!self.values.is_empty()).then(|| self.values.clone())
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn key_attrs(layout: &KeyLayout) -> impl Iterator<Item = KeyAttr> {
    std::iter::once(layout.hash).chain(layout.range)
}

fn key_schema(layout: &KeyLayout) -> Result<Vec<ddb::KeySchemaElement>> {
    let mut elements = vec![ddb::KeySchemaElement::builder()
        .attribute_name(layout.hash.name)
        .key_type(ddb::KeyType::Hash)
        .build()
        .map_err(build_err)?];
    if let Some(range) = layout.range {
        elements.push(
            ddb::KeySchemaElement::builder()
                .attribute_name(range.name)
                .key_type(ddb::KeyType::Range)
                .build()
                .map_err(build_err)?,
        );
    }
    Ok(elements)
}

fn throughput(t: Throughput) -> Result<ddb::ProvisionedThroughput> {
    ddb::ProvisionedThroughput::builder()
        .read_capacity_units(t.read_capacity)
        .write_capacity_units(t.write_capacity)
        .build()
        .map_err(build_err)
}

fn to_aws(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::S(s) => AttributeValue::S(s.clone()),
        AttrValue::N(n) => AttributeValue::N(n.clone()),
        AttrValue::B(b) => AttributeValue::B(Blob::new(b.clone())),
        AttrValue::Bool(b) => AttributeValue::Bool(*b),
        AttrValue::Null => AttributeValue::Null(true),
        AttrValue::L(list) => AttributeValue::L(list.iter().map(to_aws).collect()),
        AttrValue::M(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_aws(v)))
                .collect(),
        ),
        AttrValue::Ss(set) => AttributeValue::Ss(set.clone()),
    }
}

fn from_aws(value: AttributeValue) -> Result<AttrValue> {
    Ok(match value {
        AttributeValue::S(s) => AttrValue::S(s),
        AttributeValue::N(n) => AttrValue::N(n),
        AttributeValue::B(b) => AttrValue::B(b.into_inner()),
        AttributeValue::Bool(b) => AttrValue::Bool(b),
        AttributeValue::Null(_) => AttrValue::Null,
        AttributeValue::L(list) => {
            AttrValue::L(list.into_iter().map(from_aws).collect::<Result<_>>()?)
        }
        AttributeValue::M(map) => AttrValue::M(
            map.into_iter()
                .map(|(k, v)| Ok((k, from_aws(v)?)))
                .collect::<Result<_>>()?,
        ),
        AttributeValue::Ss(set) => AttrValue::Ss(set),
        AttributeValue::Ns(set) => AttrValue::L(set.into_iter().map(AttrValue::N).collect()),
        other => {
            return Err(StoreError::codec(format!(
                "unsupported attribute value: {other:?}"
            )))
        }
    })
}

fn to_raw(item: &Item) -> RawItem {
    item.iter().map(|(k, v)| (k.clone(), to_aws(v))).collect()
}

fn from_raw(raw: RawItem) -> Result<Item> {
    raw.into_iter().map(|(k, v)| Ok((k, from_aws(v)?))).collect()
}

fn to_raw_write(request: &WriteRequest) -> Result<ddb::WriteRequest> {
    Ok(match request {
        WriteRequest::Put(item) => ddb::WriteRequest::builder()
            .put_request(
                ddb::PutRequest::builder()
                    .set_item(Some(to_raw(item)))
                    .build()
                    .map_err(build_err)?,
            )
            .build(),
        WriteRequest::Delete(key) => ddb::WriteRequest::builder()
            .delete_request(
                ddb::DeleteRequest::builder()
                    .set_key(Some(to_raw(key)))
                    .build()
                    .map_err(build_err)?,
            )
            .build(),
    })
}

fn from_raw_write(request: ddb::WriteRequest) -> Result<WriteRequest> {
    if let Some(put) = request.put_request {
        return Ok(WriteRequest::Put(from_raw(put.item)?));
    }
    if let Some(delete) = request.delete_request {
        return Ok(WriteRequest::Delete(from_raw(delete.key)?));
    }
    Err(StoreError::codec("empty unprocessed write request"))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn conflict(table: &str, key: &Item) -> StoreError {
    StoreError::Conflict {
        table: table.to_string(),
        key: describe_key(key),
    }
}

/// A failed condition expression on a single-item write.
fn is_condition_failure<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.as_service_error().and_then(|e| e.code()) == Some("ConditionalCheckFailedException")
}

fn sdk_err<E, R>(op: &str, table: &str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    tracing::debug!(op, table, error = %DisplayErrorContext(&err), "DynamoDB request failed");
    StoreError::Backend(format!("{op} on {table}: {}", DisplayErrorContext(&err)))
}

fn build_err(err: BuildError) -> StoreError {
    StoreError::Backend(format!("invalid request: {err}"))
}
