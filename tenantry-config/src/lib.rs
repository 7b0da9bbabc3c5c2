//! Configuration for the tenantry control plane.
//!
//! Values are layered in this order, later layers winning:
//!
//! 1. defaults baked into [`ControlPlaneConfig`]
//! 2. an optional TOML or JSON file
//! 3. a `.env` file, if present
//! 4. `TENANTRY_*` environment variables
//!
//! The unprefixed `DATABASE_URL` and `RABBITMQ_URL` variables are honored as
//! fallbacks for the registry database and the broker.

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{ControlPlaneConfig, StoreBackend};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Prefix of every control plane environment variable.
pub const ENV_PREFIX: &str = "TENANTRY";

/// Unprefixed variables accepted when the prefixed key is absent.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("database_url", "registry_database_url"),
    ("rabbitmq_url", "broker_url"),
];

/// Key/value layer store that deserializes into typed settings.
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: None,
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(HashMap::new())),
            env_prefix: Some(prefix.into()),
        }
    }

    /// Merge prefixed variables from the process environment.
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        self.merge_strings(loader.load()?);
        self.apply_aliases(&EnvLoader::default());
        Ok(())
    }

    /// Merge a `.env` file into the process environment, then load it.
    ///
    /// A missing default `.env` is not an error; an explicit path must exist.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path)?;
            }
            None => {
                dotenvy::dotenv().ok();
            }
        }
        self.load_env()
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let loader = ConfigLoader::auto(path.as_ref())?;
        let data = loader.load_file(path)?;

        match data {
            serde_json::Value::Object(map) => {
                let mut config = self.config.write();
                config.extend(map);
                Ok(())
            }
            _ => Err(ConfigError::Malformed {
                format: loader.format_name(),
                message: "top level must be a table".to_string(),
            }),
        }
    }

    pub fn merge_strings(&self, values: HashMap<String, String>) {
        let mut config = self.config.write();
        for (key, value) in values {
            config.insert(key, serde_json::Value::String(value));
        }
    }

    fn apply_aliases(&self, unprefixed: &EnvLoader) {
        let mut config = self.config.write();
        for (alias, key) in ENV_ALIASES {
            if config.contains_key(*key) {
                continue;
            }
            if let Ok(value) = unprefixed.load_var(alias) {
                config.insert(key.to_string(), serde_json::Value::String(value));
            }
        }
    }

    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::WrongType {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        self.config.write().insert(key.to_string(), json_value);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let config = self.config.read();

        let value = config
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;

        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::WrongType {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has(&self, key: &str) -> bool {
        self.config.read().contains_key(key)
    }

    /// Deserialize all layers into `T` and run its validation.
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let json_value = {
            let config = self.config.read();
            serde_json::Value::Object(config.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        };

        let validated: T = serde_json::from_value(json_value)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        validated.validate()?;

        Ok(validated)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneConfig {
    /// Load the full layered configuration.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let manager = ConfigManager::with_prefix(ENV_PREFIX);
        if let Some(path) = file {
            manager.load_file(path)?;
        }
        manager.load_dotenv(None)?;
        manager.load_validated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("worker_pool_size", 4).unwrap();

        let value: usize = manager.get("worker_pool_size").unwrap();
        assert_eq!(value, 4);
        assert!(manager.has("worker_pool_size"));
        assert!(matches!(
            manager.get::<String>("missing"),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_env_strings_override_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "worker_pool_size = 2\nbroker_exchange = \"from_file\"").unwrap();

        let manager = ConfigManager::with_prefix(ENV_PREFIX);
        manager.load_file(file.path()).unwrap();
        manager.merge_strings(HashMap::from([(
            "worker_pool_size".to_string(),
            "16".to_string(),
        )]));

        let config: ControlPlaneConfig = manager.load_validated().unwrap();
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.broker_exchange, "from_file");
    }

    #[test]
    fn test_invalid_layer_fails_validation() {
        let manager = ConfigManager::new();
        manager.set("listen_addr", "nowhere").unwrap();
        let result: Result<ControlPlaneConfig> = manager.load_validated();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_table_file_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "[1, 2, 3]").unwrap();

        let manager = ConfigManager::new();
        assert!(manager.load_file(file.path()).is_err());
    }
}
