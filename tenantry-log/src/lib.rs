//! Logging for the tenantry control plane.
//!
//! All crates in the workspace log through `tracing`. This crate turns the
//! `TENANTRY_*` environment variables into a [`LogConfig`] and installs the
//! matching `tracing-subscriber` stack exactly once per process.
//!
//! # Environment Variables
//!
//! - `TENANTRY_DEBUG=1` - Force debug level
//! - `TENANTRY_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `TENANTRY_LOG_FORMAT=pretty|compact|json` - Set output format
//! - `TENANTRY_LOG_COLOR=1|0` - Enable/disable ANSI colors
//! - `TENANTRY_LOG_TIMESTAMPS=1|0` - Include timestamps
//! - `TENANTRY_LOG_TARGET=1|0` - Include the event target (module path)
//!
//! `RUST_LOG`, when present, takes precedence over the computed level so
//! operators can scope verbosity per module.
//!
//! # Usage
//!
//! ```rust,no_run
//! let config = tenantry_log::LogConfig::from_env();
//! tenantry_log::init(&config);
//! tracing::info!(tenant_id = "t-1", "tenant provisioned");
//! ```

use once_cell::sync::OnceCell;
use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum level that reaches the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// No output at all
    Off,
}

impl Level {
    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event, for log shippers
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether ANSI colors are emitted
    pub color: bool,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include the event target
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Compact,
            color: false,
            timestamps: true,
            target: true,
        }
    }
}

impl LogConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };

        let debug = flag("TENANTRY_DEBUG", false);
        let level = lookup("TENANTRY_LOG_LEVEL")
            .and_then(|s| Level::parse(&s))
            .unwrap_or(Level::Info);
        // Debug mode only ever makes output more verbose.
        let level = if debug { level.min(Level::Debug) } else { level };

        let format = lookup("TENANTRY_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Compact);

        let tty_default = lookup("NO_COLOR").is_none() && lookup("TERM").is_some();
        let color = format != Format::Json && flag("TENANTRY_LOG_COLOR", tty_default);

        Self {
            level,
            format,
            color,
            timestamps: flag("TENANTRY_LOG_TIMESTAMPS", true),
            target: flag("TENANTRY_LOG_TARGET", true),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Filter used when `RUST_LOG` is absent or unparsable.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_directive()))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer().with_ansi(self.color).with_target(self.target);
        match (self.format, self.timestamps) {
            (Format::Json, true) => base.json().boxed(),
            (Format::Json, false) => base.json().without_time().boxed(),
            (Format::Pretty, true) => base.pretty().boxed(),
            (Format::Pretty, false) => base.pretty().without_time().boxed(),
            (Format::Compact, true) => base.compact().boxed(),
            (Format::Compact, false) => base.compact().without_time().boxed(),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Install the global subscriber.
///
/// Returns `true` only for the call that actually installed it. Subsequent
/// calls, or a process where another subscriber was already set, return
/// `false`.
pub fn init(config: &LogConfig) -> bool {
    let mut first = false;
    INSTALLED.get_or_init(|| {
        first = true;
        tracing_subscriber::registry()
            .with(config.fmt_layer())
            .with(config.env_filter())
            .try_init()
            .is_ok()
    });
    first && INSTALLED.get().copied().unwrap_or(false)
}

/// Install a subscriber from the environment. Convenience for binaries.
pub fn init_from_env() -> bool {
    init(&LogConfig::from_env())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("WARNING"), Some(Level::Warn));
        assert_eq!(Level::parse(" none "), Some(Level::Off));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse("Pretty"), Some(Format::Pretty));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_defaults_without_env() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Compact);
        assert!(!config.color);
        assert!(config.timestamps);
    }

    #[test]
    fn test_debug_flag_lowers_level() {
        let config = LogConfig::from_lookup(lookup(&[
            ("TENANTRY_DEBUG", "true"),
            ("TENANTRY_LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.level, Level::Debug);

        let config = LogConfig::from_lookup(lookup(&[
            ("TENANTRY_DEBUG", "1"),
            ("TENANTRY_LOG_LEVEL", "trace"),
        ]));
        assert_eq!(config.level, Level::Trace);
    }

    #[test]
    fn test_json_never_colored() {
        let config = LogConfig::from_lookup(lookup(&[
            ("TENANTRY_LOG_FORMAT", "json"),
            ("TENANTRY_LOG_COLOR", "1"),
            ("TERM", "xterm"),
        ]));
        assert_eq!(config.format, Format::Json);
        assert!(!config.color);
    }

    #[test]
    fn test_init_only_once() {
        let config = LogConfig::default().with_level(Level::Off);
        let _ = init(&config);
        assert!(!init(&config));
    }
}
