//! The adapter handle.
//!
//! A [`Store`] captures its configuration at construction and never changes
//! it afterwards. The only shared resource is the backend handle, which is
//! safe for unlimited concurrent use, so a `Store` can be shared freely
//! behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use courier_shared::Uid;

use crate::backend::{Backend, QueryRequest};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::fanout;
use crate::item::{AttrValue, Item};
use crate::pager::{self, FailurePolicy};
use crate::schema::{table_schemas, Table, TableSchema};

pub struct Store {
    backend: Arc<dyn Backend>,
    schemas: HashMap<Table, TableSchema>,
    self_talk_uid: Uid,
    parallelism: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tables", &self.schemas.values().map(|s| &s.name).collect::<Vec<_>>())
            .field("self_talk_uid", &self.self_talk_uid)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl Store {
    pub fn open(backend: Arc<dyn Backend>, config: &StoreConfig) -> Result<Self> {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn Backend>,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.self_chat_service_id == 0 {
            return Err(StoreError::Config(
                "self_chat_service_id must be non-zero".to_string(),
            ));
        }

        let schemas = table_schemas(config)
            .into_iter()
            .map(|s| (s.table, s))
            .collect();

        tracing::info!(
            self_talk_uid = config.self_chat_service_id,
            parallelism = config.max_parallel_requests,
            "store opened"
        );

        Ok(Self {
            backend,
            schemas,
            self_talk_uid: Uid(config.self_chat_service_id),
            parallelism: config.max_parallel_requests.max(1),
            clock,
        })
    }

    pub fn self_talk_uid(&self) -> Uid {
        self.self_talk_uid
    }

    pub fn schema(&self, table: Table) -> &TableSchema {
        // Every Table variant is inserted at construction.
        &self.schemas[&table]
    }

    /// Configured backend name of `table`.
    pub fn table(&self, table: Table) -> &str {
        &self.schema(table).name
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub(crate) fn query(
        &self,
        table: Table,
        attr: &str,
        value: impl Into<AttrValue>,
    ) -> QueryRequest {
        QueryRequest::new(self.table(table), attr, value)
    }

    pub(crate) async fn get_one(&self, table: Table, key: &Item) -> Result<Option<Item>> {
        self.backend.get_item(self.table(table), key, None).await
    }

    pub(crate) async fn query_all(
        &self,
        request: QueryRequest,
        quota: Option<usize>,
        policy: FailurePolicy,
    ) -> Result<Vec<Item>> {
        pager::collect_pages(self.backend(), request, quota, policy).await
    }

    pub(crate) async fn get_many(
        &self,
        table: Table,
        keys: Vec<Item>,
        projection: Option<&[String]>,
        policy: FailurePolicy,
    ) -> Result<Vec<Item>> {
        fanout::batch_get_all(
            self.backend(),
            self.table(table),
            keys,
            projection,
            self.parallelism,
            policy,
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    pub fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// Store over a fresh in-memory backend with all tables created.
    pub async fn store_with(backend: MemoryBackend) -> (Store, Arc<MemoryBackend>) {
        let backend = Arc::new(backend);
        let store = Store::with_clock(
            backend.clone(),
            &StoreConfig::default(),
            Arc::new(FixedClock(fixed_now())),
        )
        .unwrap();
        store.create_db(false).await.unwrap();
        (store, backend)
    }

    pub async fn test_store() -> (Store, Arc<MemoryBackend>) {
        store_with(MemoryBackend::new()).await
    }
}
