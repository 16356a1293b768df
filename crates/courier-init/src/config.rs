//! Bootstrap settings loaded from environment variables.
//!
//! Table layout and backend connection details live in the store's JSON
//! configuration; the environment only says where to find it and what to do.

use std::path::PathBuf;

use courier_store::StoreConfig;

/// Which backend the bootstrap runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    DynamoDb,
    /// Throwaway in-memory tables, useful for checking a configuration.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    /// Path to the store's JSON configuration.
    /// Env: `COURIER_STORE_CONFIG`
    /// Default: none (built-in defaults).
    pub store_config_path: Option<PathBuf>,

    /// Drop every table before creating it.
    /// Env: `COURIER_RESET_DB` (true/false)
    /// Default: `false`
    pub reset: bool,

    /// Env: `COURIER_BACKEND` (`dynamodb` or `memory`)
    /// Default: `dynamodb` when compiled in, otherwise `memory`.
    pub backend: BackendKind,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            store_config_path: None,
            reset: false,
            backend: if cfg!(feature = "dynamodb") {
                BackendKind::DynamoDb
            } else {
                BackendKind::Memory
            },
        }
    }
}

impl InitConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("COURIER_STORE_CONFIG").filter(|p| !p.is_empty()) {
            config.store_config_path = Some(PathBuf::from(path));
        }

        if let Some(val) = lookup("COURIER_RESET_DB") {
            config.reset = val == "true" || val == "1";
        }

        if let Some(val) = lookup("COURIER_BACKEND") {
            match val.to_ascii_lowercase().as_str() {
                "dynamodb" => config.backend = BackendKind::DynamoDb,
                "memory" => config.backend = BackendKind::Memory,
                other => {
                    tracing::warn!(value = %other, "Unknown COURIER_BACKEND, using default");
                }
            }
        }

        config
    }

    /// The store configuration named by `store_config_path`, or defaults.
    pub fn load_store_config(&self) -> courier_store::Result<StoreConfig> {
        match &self.store_config_path {
            Some(path) => StoreConfig::from_file(path),
            None => Ok(StoreConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = InitConfig::from_lookup(lookup(&[]));
        assert_eq!(config, InitConfig::default());
        assert!(!config.reset);
        assert_eq!(config.load_store_config().unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = InitConfig::from_lookup(lookup(&[
            ("COURIER_RESET_DB", "1"),
            ("COURIER_BACKEND", "Memory"),
            ("COURIER_STORE_CONFIG", "/etc/courier/store.json"),
        ]));
        assert!(config.reset);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(
            config.store_config_path,
            Some(PathBuf::from("/etc/courier/store.json"))
        );

        let unknown = InitConfig::from_lookup(lookup(&[("COURIER_BACKEND", "postgres")]));
        assert_eq!(unknown.backend, InitConfig::default().backend);
    }

    #[test]
    fn test_store_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"self_chat_service_id": 42}}"#).unwrap();
        let config = InitConfig {
            store_config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.load_store_config().unwrap().self_chat_service_id, 42);

        let missing = InitConfig {
            store_config_path: Some(PathBuf::from("/nonexistent/store.json")),
            ..Default::default()
        };
        assert!(missing.load_store_config().is_err());
    }
}
