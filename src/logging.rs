//! Logging setup.
//!
//! Harbor logs through `tracing`. [`init`] installs a subscriber configured
//! from the environment:
//!
//! - `HARBOR_DEBUG=1` - Enable debug logging
//! - `HARBOR_LOG_LEVEL=trace|debug|info|warn|error` - Set log level
//! - `HARBOR_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `HARBOR_LOG_COLOR=1|0` - Enable/disable colors
//!
//! `RUST_LOG`, when set, replaces the level with a full filter directive.

use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human readable
    Pretty,
    /// Single line
    Compact,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level directive, such as `info` or `harbor_queue=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Whether to emit ANSI colors
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            color: true,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Read `HARBOR_*` logging variables.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from variables resolved by `lookup`.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup("HARBOR_DEBUG").is_some_and(|v| is_truthy(&v));

        let level = lookup("HARBOR_LOG_LEVEL")
            .map(|v| v.to_lowercase())
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let format = lookup("HARBOR_LOG_FORMAT")
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Compact);

        let color = lookup("HARBOR_LOG_COLOR")
            .map(|v| is_truthy(&v))
            .unwrap_or_else(|| lookup("NO_COLOR").is_none());

        Self {
            level,
            format,
            color,
        }
    }

    /// The event filter: `RUST_LOG` if set, otherwise the configured level.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Install the global subscriber from environment variables.
///
/// Does nothing if a subscriber is already installed.
pub fn init() {
    init_with(&LogConfig::from_env());
}

/// Install the global subscriber from an explicit configuration.
///
/// Returns false if a subscriber was already installed.
pub fn init_with(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.filter());

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(config.color))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.color))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
        LogConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.color);
    }

    #[test]
    fn test_debug_flag() {
        assert_eq!(config(&[("HARBOR_DEBUG", "1")]).level, "debug");
        assert_eq!(config(&[("HARBOR_DEBUG", "true")]).level, "debug");
        assert_eq!(
            config(&[("HARBOR_DEBUG", "1"), ("HARBOR_LOG_LEVEL", "warn")]).level,
            "warn"
        );
    }

    #[test]
    fn test_format_and_color() {
        let config = config(&[("HARBOR_LOG_FORMAT", "json"), ("NO_COLOR", "1")]);
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.color);
    }

    #[test]
    fn test_init_twice() {
        let config = LogConfig {
            level: "off".to_string(),
            ..Default::default()
        };
        init_with(&config);
        assert!(!init_with(&config));
    }
}
