//! Telemetry: structured logging for the queue daemon and tooling.
//!
//! Counters are emitted through the `metrics` facade at the call sites
//! (dispatcher, pool, errors); installing an exporter is left to the host
//! binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskq_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
