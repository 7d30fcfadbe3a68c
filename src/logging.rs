//! Logging setup and structured helpers on top of `tracing`.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Environment variable to control log level filtering
const LOG_LEVEL_ENV_VAR: &str = "CSUTILITY_LOG_LEVEL";

/// Default log level when not specified
const DEFAULT_LOG_LEVEL: LogLevel = LogLevel::Info;

static LOGGING_INSTALLED: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Output format of the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Network,
    Validation,
    System,
    Download,
    Storage,
    Unknown,
}

impl LogLevel {
    /// Directive understood by `EnvFilter` for this crate.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        DEFAULT_LOG_LEVEL
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "trace" => Ok(LogLevel::Debug),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::System => "system",
            ErrorCategory::Download => "download",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Resolve the filter: `RUST_LOG` wins, then `CSUTILITY_LOG_LEVEL`, then the default.
fn build_filter(rust_log: Option<String>, level_var: Option<String>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|s| !s.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }

    let level = level_var.and_then(|s| s.parse::<LogLevel>().ok()).unwrap_or(DEFAULT_LOG_LEVEL);
    EnvFilter::new(level.as_directive())
}

/// Install the global subscriber. Returns `false` when one was already installed.
pub fn init_logging(format: LogFormat) -> bool {
    if LOGGING_INSTALLED.set(()).is_err() {
        return false;
    }

    let filter = build_filter(std::env::var("RUST_LOG").ok(), std::env::var(LOG_LEVEL_ENV_VAR).ok());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };

    if let Err(e) = result {
        // Host application installed its own subscriber; keep using it.
        eprintln!("Logging subscriber not installed: {}", e);
        return false;
    }
    true
}

/// Log an error with a category and JSON context attached as fields.
pub fn log_error_with_context(
    category: ErrorCategory,
    message: &str,
    context: serde_json::Value,
    error_details: Option<&str>,
) {
    tracing::error!(
        category = category.as_str(),
        context = %context,
        details = error_details.unwrap_or_default(),
        "{message}"
    );
}

/// Convenience function to log errors with minimal boilerplate.
pub fn log_error_simple(category: ErrorCategory, message: &str, error_details: Option<&str>) {
    tracing::error!(category = category.as_str(), details = error_details.unwrap_or_default(), "{message}");
}

pub fn log_warning_with_context(category: ErrorCategory, message: &str, context: serde_json::Value) {
    tracing::warn!(category = category.as_str(), context = %context, "{message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("error".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" info ".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_display_and_directive() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Debug.as_directive(), "debug");
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_build_filter_prefers_rust_log() {
        let filter = build_filter(Some("csutility_lib=debug".into()), Some("error".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_build_filter_falls_back_to_level_var() {
        let filter = build_filter(None, Some("warn".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));

        let filter = build_filter(Some("   ".into()), Some("nonsense".into()));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_error_category_names() {
        assert_eq!(ErrorCategory::Storage.as_str(), "storage");
        assert_eq!(ErrorCategory::Network.as_str(), "network");
    }
}
