// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Reads variables under an optional prefix and normalizes their keys.
///
/// `TENANTRY_BROKER_URL` with prefix `TENANTRY` becomes `broker_url`.
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load every matching variable from the process environment.
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.collect(env::vars()))
    }

    /// Same as [`load`](Self::load) over an explicit set of variables.
    pub fn collect<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = HashMap::new();

        for (key, value) in vars {
            match self.prefix {
                Some(ref prefix) => {
                    let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                        continue;
                    };
                    // TENANTRYX_FOO must not match prefix TENANTRY.
                    let Some(rest) = rest.strip_prefix('_') else {
                        continue;
                    };
                    if !rest.is_empty() {
                        config.insert(rest.to_lowercase(), value);
                    }
                }
                None => {
                    config.insert(key.to_lowercase(), value);
                }
            }
        }

        config
    }

    /// Load a specific variable, applying the prefix.
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = match self.prefix {
            Some(ref prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        };

        env::var(&full_key).map_err(|source| ConfigError::Env { name: full_key, source })
    }

    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prefix_is_stripped_and_lowercased() {
        let loader = EnvLoader::new(Some("TENANTRY".to_string()));
        let loaded = loader.collect(vars(&[
            ("TENANTRY_BROKER_URL", "amqp://mq"),
            ("TENANTRY_WORKER_POOL_SIZE", "4"),
            ("PATH", "/usr/bin"),
        ]));

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["broker_url"], "amqp://mq");
        assert_eq!(loaded["worker_pool_size"], "4");
    }

    #[test]
    fn test_prefix_requires_separator() {
        let loader = EnvLoader::new(Some("TENANTRY".to_string()));
        let loaded = loader.collect(vars(&[("TENANTRYX_FOO", "1"), ("TENANTRY_", "2")]));
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_no_prefix_keeps_everything() {
        let loader = EnvLoader::default();
        let loaded = loader.collect(vars(&[("DATABASE_URL", "postgres://db")]));
        assert_eq!(loaded["database_url"], "postgres://db");
    }

    #[test]
    fn test_missing_var_uses_default() {
        let loader = EnvLoader::new(Some("TENANTRY_TEST".to_string()));
        assert!(loader.load_var("MISSING_VAR_67890").is_err());
        assert_eq!(loader.load_var_or("MISSING_VAR_67890", "fallback"), "fallback");
    }
}
