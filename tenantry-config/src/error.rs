//! Errors raised while loading and validating control plane settings.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// No layer defines the key.
    #[error("setting `{0}` is not defined")]
    MissingKey(String),

    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {} is not .toml, .json or .env", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("cannot load .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("malformed {format} settings: {message}")]
    Malformed { format: &'static str, message: String },

    #[error("setting `{key}` has the wrong shape: {message}")]
    WrongType { key: String, message: String },

    /// Settings parsed but break a rule, e.g. a postgres backend without a master key.
    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("environment variable {name}: {source}")]
    Env {
        name: String,
        #[source]
        source: std::env::VarError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
