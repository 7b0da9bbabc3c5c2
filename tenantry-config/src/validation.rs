// Configuration validation

use crate::{ConfigError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::net::SocketAddr;

/// Implemented by typed configuration structs.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable validation rules.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{} cannot be empty",
                field
            )));
        }
        Ok(())
    }

    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::Invalid(format!(
                "{} must be between {} and {}",
                field, min, max
            )));
        }
        Ok(())
    }

    pub fn one_of<T: PartialEq + std::fmt::Debug>(value: &T, allowed: &[T], field: &str) -> Result<()> {
        if !allowed.contains(value) {
            return Err(ConfigError::Invalid(format!(
                "{} must be one of {:?}",
                field, allowed
            )));
        }
        Ok(())
    }

    /// Validate that a URL uses one of the given schemes.
    pub fn has_scheme(value: &str, schemes: &[&str], field: &str) -> Result<()> {
        let scheme = value.split_once("://").map(|(s, _)| s);
        match scheme {
            Some(s) if schemes.contains(&s) => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "{} must be a URL with scheme {}",
                field,
                schemes.join("|")
            ))),
        }
    }

    pub fn is_socket_addr(value: &str, field: &str) -> Result<()> {
        value.parse::<SocketAddr>().map(|_| ()).map_err(|_| {
            ConfigError::Invalid(format!("{} must be host:port, got {}", field, value))
        })
    }

    pub fn is_port(value: u16, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be a valid port number",
                field
            )));
        }
        Ok(())
    }

    /// Validate a base64 encoded key of an exact decoded length.
    pub fn is_base64_key(value: &str, len: usize, field: &str) -> Result<()> {
        let decoded = STANDARD.decode(value.trim()).map_err(|_| {
            ConfigError::Invalid(format!("{} must be base64 encoded", field))
        })?;
        if decoded.len() != len {
            return Err(ConfigError::Invalid(format!(
                "{} must decode to {} bytes",
                field, len
            )));
        }
        Ok(())
    }
}
