//! Structured logging with JSON, pretty and compact formats.
//!
//! - JSON format for daemons under a log collector
//! - Pretty format for local development
//! - Per-module log level configuration
//! - `RUST_LOG` takes precedence over the configured level when set

use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{ErrorCode, QueueError, Result};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels, e.g. `taskq_core::jobs::dispatcher = "debug"`
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include thread information
    #[serde(default)]
    pub include_thread: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Span event configuration
    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_thread: false,
            include_target: default_include_target(),
            span_events: SpanEventConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

/// Configuration for span event logging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanEventConfig {
    /// Log when spans are created
    #[serde(default)]
    pub on_new: bool,

    /// Log when spans are closed (includes busy/idle timings)
    #[serde(default)]
    pub on_close: bool,
}

impl SpanEventConfig {
    fn to_fmt_span(&self) -> FmtSpan {
        let mut span = FmtSpan::NONE;
        if self.on_new {
            span |= FmtSpan::NEW;
        }
        if self.on_close {
            span |= FmtSpan::CLOSE;
        }
        span
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include_target() -> bool {
    true
}

/// Build the filter: `RUST_LOG` when present, otherwise the configured level
/// plus per-module directives.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level).map_err(|e| {
        QueueError::with_internal(ErrorCode::InvalidConfiguration, "Invalid log level", e.to_string())
    })?;

    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        let parsed = directive.parse().map_err(|e: tracing_subscriber::filter::ParseError| {
            QueueError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid per-module log directive",
                format!("{}: {}", directive, e),
            )
        })?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a directive is malformed or a subscriber is already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()
        }
    };

    installed.map_err(|e| QueueError::internal(format!("Failed to install log subscriber: {}", e)))
}
