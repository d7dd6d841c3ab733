//! servicekit - Production service scaffolding
//!
//! Everything an HTTP service needs around its handlers: a Prometheus
//! metrics registry with automatic request instrumentation, on-demand
//! health probes, an ordered middleware chain, and a two-listener
//! lifecycle with graceful shutdown.
//!
//! ```no_run
//! use servicekit::{Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut service = Service::new("orders", ServiceConfig::from_env()?)?;
//!     service.handle("/orders/:id", |_req| async { "order" });
//!     service.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod ops;
pub mod service;
pub mod shutdown;

mod summary;

pub use config::ServiceConfig;
pub use error::{HealthError, MetricsError, ServiceError};
pub use health::{HealthProbe, HealthRegistry, HealthSnapshot, OverallStatus, ProbeResult};
pub use metrics::{MetricSpec, MetricsRegistry};
pub use middleware::{
    handler_fn, link, path_param, request_metrics, request_span, BoxedHandler, Middleware,
    MiddlewareChain,
};
pub use service::{LifecycleState, Service, ShutdownHandle};
pub use shutdown::ShutdownSequencer;
