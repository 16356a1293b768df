//! Adapter configuration.
//!
//! Loaded once from a JSON document and captured by the [`Store`] at open
//! time. Every field has a default, so an empty object `{}` is a valid
//! configuration for local development.
//!
//! [`Store`]: crate::store::Store

use std::path::Path;

use serde::{Deserialize, Serialize};

use courier_shared::constants::DEFAULT_SELF_TALK_SERVICE_ID;

use crate::error::{Result, StoreError};

/// Default bound on concurrent sub-requests issued by one operation.
pub const DEFAULT_MAX_PARALLEL_REQUESTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Throughput {
    pub read_capacity: i64,
    pub write_capacity: i64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self {
            read_capacity: 5,
            write_capacity: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    pub name: String,
    #[serde(default)]
    pub provisioned_throughput: Throughput,
}

impl TableSettings {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            provisioned_throughput: Throughput::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub users: TableSettings,
    pub auth: TableSettings,
    pub tagunique: TableSettings,
    pub topics: TableSettings,
    pub subscriptions: TableSettings,
    pub messages: TableSettings,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            users: TableSettings::named("TinodeUsers"),
            auth: TableSettings::named("TinodeAuth"),
            tagunique: TableSettings::named("TinodeTagUnique"),
            topics: TableSettings::named("TinodeTopics"),
            subscriptions: TableSettings::named("TinodeSubscriptions"),
            messages: TableSettings::named("TinodeMessages"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub provisioned_throughput: Throughput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub userid: IndexSettings,
    pub source: IndexSettings,
    pub user_updated_at: IndexSettings,
    pub topic: IndexSettings,
}

/// Full adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend region, e.g. `us-east-1`. Falls back to the environment.
    pub region: Option<String>,

    /// Endpoint override, e.g. `http://localhost:8000` for a local backend.
    pub endpoint: Option<String>,

    /// Named credentials profile.
    pub profile: Option<String>,

    /// Numeric id of the reserved self-talk service account.
    pub self_chat_service_id: u64,

    pub table_config: TableConfig,

    pub index_config: IndexConfig,

    /// Upper bound on concurrent sub-requests issued by one fan-out.
    pub max_parallel_requests: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            profile: None,
            self_chat_service_id: DEFAULT_SELF_TALK_SERVICE_ID,
            table_config: TableConfig::default(),
            index_config: IndexConfig::default(),
            max_parallel_requests: DEFAULT_MAX_PARALLEL_REQUESTS,
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading store config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.self_chat_service_id == 0 {
            return Err(StoreError::Config(
                "self_chat_service_id must be non-zero".to_string(),
            ));
        }
        if self.max_parallel_requests == 0 {
            return Err(StoreError::Config(
                "max_parallel_requests must be at least 1".to_string(),
            ));
        }
        let t = &self.table_config;
        for settings in [
            &t.users,
            &t.auth,
            &t.tagunique,
            &t.topics,
            &t.subscriptions,
            &t.messages,
        ] {
            if settings.name.is_empty() {
                return Err(StoreError::Config("table name must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StoreConfig::from_json("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.table_config.messages.name, "TinodeMessages");
        assert_eq!(config.self_chat_service_id, 5);
        assert_eq!(config.index_config.topic.provisioned_throughput.read_capacity, 5);
    }

    #[test]
    fn test_partial_override() {
        let config = StoreConfig::from_json(
            r#"{
                "region": "eu-west-1",
                "endpoint": "http://localhost:8000",
                "table_config": {
                    "users": {"name": "Users", "provisioned_throughput": {"read_capacity": 20}}
                },
                "max_parallel_requests": 2
            }"#,
        )
        .unwrap();
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.table_config.users.name, "Users");
        assert_eq!(config.table_config.users.provisioned_throughput.read_capacity, 20);
        assert_eq!(config.table_config.users.provisioned_throughput.write_capacity, 5);
        assert_eq!(config.table_config.auth.name, "TinodeAuth");
        assert_eq!(config.max_parallel_requests, 2);
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = StoreConfig::from_json(r#"{"max_parallel_requests": 0}"#).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"self_chat_service_id": 42}}"#).unwrap();
        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.self_chat_service_id, 42);
    }
}
