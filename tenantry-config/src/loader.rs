// Configuration file loaders

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Json,
    Toml,
    Env,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            "env" => Some(FileFormat::Env),
            _ => None,
        }
    }
}

/// Configuration file loader
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    pub fn format_name(&self) -> &'static str {
        match self.format {
            FileFormat::Json => "JSON",
            FileFormat::Toml => "TOML",
            FileFormat::Env => "env",
        }
    }

    /// Pick the format from the file extension.
    pub fn auto(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = path
            .extension()
            .and_then(|s| s.to_str())
            .and_then(FileFormat::from_extension)
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.to_path_buf()))?;

        Ok(Self::new(format))
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> Result<Value> {
        match self.format {
            FileFormat::Json => self.parse_json(content),
            FileFormat::Toml => self.parse_toml(content),
            FileFormat::Env => self.parse_env(content),
        }
    }

    fn parse_json(&self, content: &str) -> Result<Value> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Malformed {
            format: "JSON",
            message: e.to_string(),
        })
    }

    fn parse_toml(&self, content: &str) -> Result<Value> {
        let toml_value: toml::Value = toml::from_str(content)
            .map_err(|e| ConfigError::Malformed {
            format: "TOML",
            message: e.to_string(),
        })?;

        serde_json::to_value(toml_value)
            .map_err(|e| ConfigError::Malformed {
            format: "TOML",
            message: e.to_string(),
        })
    }

    fn parse_env(&self, content: &str) -> Result<Value> {
        let mut map = serde_json::Map::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_lowercase();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                map.insert(key, Value::String(value.to_string()));
            }
        }

        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_keeps_types() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let value = loader
            .parse(
                r#"
                broker_url = "amqp://mq:5672/"
                worker_pool_size = 4
            "#,
            )
            .unwrap();

        assert_eq!(value["broker_url"], "amqp://mq:5672/");
        assert_eq!(value["worker_pool_size"], 4);
    }

    #[test]
    fn test_parse_env_file() {
        let loader = ConfigLoader::new(FileFormat::Env);
        let value = loader
            .parse(
                r#"
                # admin connection
                ADMIN_DATABASE_URL="postgres://admin:pw@db:5432/postgres"
                LEASE_TTL_SECS=60
            "#,
            )
            .unwrap();

        assert_eq!(value["admin_database_url"], "postgres://admin:pw@db:5432/postgres");
        assert_eq!(value["lease_ttl_secs"], "60");
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let loader = ConfigLoader::new(FileFormat::Json);
        assert!(matches!(loader.parse("{"), Err(ConfigError::Malformed { format: "JSON", .. })));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("JSON"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("toml"), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_extension("yaml"), None);
        assert!(ConfigLoader::auto("tenantry.toml").is_ok());
        assert!(ConfigLoader::auto("tenantry").is_err());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let err = loader.load_file("/nonexistent/tenantry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path.ends_with("tenantry.toml")));
        assert!(matches!(
            ConfigLoader::auto("tenantry.yaml"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
