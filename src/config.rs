//! Environment-variable driven service configuration.
//!
//! Every knob has a default, so a service can boot with an empty
//! environment. Malformed values fail at startup, before any
//! listener binds.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;

/// Configuration for both listeners and the shutdown budget.
///
/// Loaded from the environment via [`ServiceConfig::from_env`], or
/// constructed with [`Default`] and adjusted in code.
#[derive(Envconfig, Debug, Clone)]
pub struct ServiceConfig {
    /// Primary (application traffic) listen address.
    #[envconfig(from = "ADDR", default = "0.0.0.0:8080")]
    pub addr: String,

    /// Socket read budget, also the evaluation deadline for the
    /// operational health endpoints.
    #[envconfig(from = "READ_TIMEOUT_SECS", default = "10")]
    pub read_timeout_secs: u64,

    /// Per-request handler budget on the primary listener.
    #[envconfig(from = "WRITE_TIMEOUT_SECS", default = "10")]
    pub write_timeout_secs: u64,

    /// Idle connection budget. Accepted for environment compatibility
    /// but not enforced by the lifecycle.
    #[envconfig(from = "IDLE_TIMEOUT_SECS", default = "120")]
    pub idle_timeout_secs: u64,

    /// Operational (metrics/health) listen address.
    #[envconfig(from = "OPS_ADDR", default = "0.0.0.0:9090")]
    pub ops_addr: String,

    /// Path serving the Prometheus text exposition.
    #[envconfig(from = "METRICS_PATH", default = "/metrics")]
    pub metrics_path: String,

    /// Path serving the aggregate health report.
    #[envconfig(from = "HEALTH_PATH", default = "/health")]
    pub health_path: String,

    /// Path serving the readiness probe.
    #[envconfig(from = "READINESS_PATH", default = "/ready")]
    pub readiness_path: String,

    /// Path serving the liveness probe.
    #[envconfig(from = "LIVENESS_PATH", default = "/live")]
    pub liveness_path: String,

    /// Total budget shared by shutdown hooks and listener drain.
    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,

    /// Service version string reported in the health payload.
    #[envconfig(from = "SERVICE_VERSION", default = "dev")]
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            idle_timeout_secs: 120,
            ops_addr: "0.0.0.0:9090".to_string(),
            metrics_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
            readiness_path: "/ready".to_string(),
            liveness_path: "/live".to_string(),
            shutdown_timeout_secs: 30,
            version: "dev".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate configuration from the environment.
    ///
    /// # Errors
    /// Returns a detailed error if a variable is malformed or a
    /// validation rule is violated.
    pub fn from_env() -> Result<Self> {
        let config = Self::init_from_env()
            .context("Failed to load service configuration from environment")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<()> {
        self.addr
            .parse::<SocketAddr>()
            .with_context(|| format!("ADDR is not a valid socket address: {}", self.addr))?;
        self.ops_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("OPS_ADDR is not a valid socket address: {}", self.ops_addr))?;
        anyhow::ensure!(
            self.addr != self.ops_addr,
            "primary and operational listeners must use distinct addresses, both got {}",
            self.addr
        );

        for (name, path) in [
            ("METRICS_PATH", &self.metrics_path),
            ("HEALTH_PATH", &self.health_path),
            ("READINESS_PATH", &self.readiness_path),
            ("LIVENESS_PATH", &self.liveness_path),
        ] {
            anyhow::ensure!(
                path.starts_with('/'),
                "{} must start with '/', got {}",
                name,
                path
            );
        }

        anyhow::ensure!(
            self.shutdown_timeout_secs > 0,
            "SHUTDOWN_TIMEOUT_SECS must be positive"
        );
        anyhow::ensure!(
            self.read_timeout_secs > 0 && self.write_timeout_secs > 0,
            "READ_TIMEOUT_SECS and WRITE_TIMEOUT_SECS must be positive"
        );

        Ok(())
    }

    /// Read budget as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Handler budget as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Shutdown budget as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
