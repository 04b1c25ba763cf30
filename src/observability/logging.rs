//! Structured logging on top of `tracing`
//!
//! Every event emitted by a runner carries the device id as a structured
//! field, so the output of a whole fleet can be filtered per device.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: emit span open/close events (true/false, default false)
//! - `RUST_LOG`: full filter override, `env_logger` syntax
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG fieldlink run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored
    Compact,
}

impl LogFormat {
    /// Parse a format name; anything unknown falls back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; anything unknown falls back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Filter for `level` with chatty dependencies held at WARN
pub fn default_filter(level: Level) -> EnvFilter {
    let mut filter = EnvFilter::new(level.to_string());
    for directive in ["rumqttc=warn", "rustls=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, replaces the level-based filter. Calling this
/// again after a subscriber is installed is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => default_filter(level),
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`.
///
/// `level`, when given, takes the place of `LOG_LEVEL`.
pub fn init_default_logging(level: Option<Level>) {
    let level = level.unwrap_or_else(|| parse_level(&env::var("LOG_LEVEL").unwrap_or_default()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span covering everything one device runner does
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_runner", $($field)*)
    };
}

/// Span for one direct-method invocation
#[macro_export]
macro_rules! method_span {
    ($($field:tt)*) => {
        tracing::info_span!("direct_method", $($field)*)
    };
}

pub use {device_span, method_span};
