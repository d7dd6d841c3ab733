//! Error types for registration, startup, and shutdown failures.
//!
//! Registration conflicts are returned to the caller instead of
//! panicking or silently overwriting. Listener errors distinguish
//! bind failures (fatal at startup, nothing to clean up) from
//! runtime and shutdown failures.

use thiserror::Error;

/// Errors produced by [`crate::metrics::MetricsRegistry`].
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric with the same (prefixed) name is already registered.
    #[error("metric {name} already registered")]
    AlreadyExists { name: String },

    /// No metric with this name and kind has been registered.
    #[error("metric {name} not found")]
    NotFound { name: String },

    /// The descriptor was rejected (empty name, reserved name, invalid
    /// buckets or objectives).
    #[error("invalid metric descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// The supplied label values do not match the registered label names.
    #[error("label values for {name} do not match registered label names")]
    InvalidLabels {
        name: String,
        #[source]
        source: prometheus::Error,
    },

    /// Underlying registry or encoding failure.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Errors produced by [`crate::health::HealthRegistry`].
#[derive(Debug, Error)]
pub enum HealthError {
    /// A probe with the same name is already registered.
    #[error("health probe {name} already registered")]
    AlreadyExists { name: String },
}

/// Errors produced by the service lifecycle.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The supplied configuration failed validation.
    #[error("invalid service configuration")]
    Config(#[source] anyhow::Error),

    /// Could not bind a listening socket. Surfaced immediately at
    /// startup, before any task is spawned.
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A listener failed while serving traffic.
    #[error("{listener} listener failed")]
    Listener {
        listener: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A listener task aborted or panicked.
    #[error("{listener} listener task failed")]
    ListenerTask {
        listener: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },

    /// A listener did not stop within the configured shutdown deadline.
    #[error("{listener} listener did not stop within the shutdown deadline")]
    ShutdownTimeout { listener: &'static str },

    /// The lifecycle was started more than once.
    #[error("service already started")]
    AlreadyStarted,

    /// Failure while building the built-in metric series.
    #[error("failed to initialize metrics")]
    Metrics(#[from] MetricsError),
}
