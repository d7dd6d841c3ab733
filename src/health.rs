//! Health probes with per-probe timeouts and criticality.
//!
//! Probes are invoked on demand when a health, readiness, or liveness
//! query arrives; the registry performs no I/O of its own and never
//! polls. Every probe runs concurrently, bounded by the smaller of its
//! own timeout and the caller's evaluation deadline, so one slow probe
//! cannot stall an evaluation past the caller's budget.
//!
//! Liveness is deliberately probe-independent: the process being able
//! to answer is the liveness signal, so degraded downstream
//! dependencies never cause needless restarts.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::HealthError;

/// Default per-probe timeout when none is configured.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named, independently-invocable health check.
///
/// Probes are critical by default: a critical failure flips the
/// aggregate status to unhealthy, while an advisory failure is only
/// recorded.
#[derive(Clone)]
pub struct HealthProbe {
    name: String,
    timeout: Duration,
    critical: bool,
    check: CheckFn,
}

impl HealthProbe {
    /// Create a critical probe with the default 5s timeout.
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            critical: true,
            check: Arc::new(move || check().boxed()),
        }
    }

    /// Set the per-probe timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the probe advisory: its failure is recorded but does not
    /// flip the aggregate status.
    #[must_use]
    pub fn advisory(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Probe name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Aggregate status over one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every probe passed.
    Healthy,
    /// Only advisory probes failed.
    Degraded,
    /// At least one critical probe failed.
    Unhealthy,
}

/// Outcome of a single probe within one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Pointwise result of evaluating every registered probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub service: String,
    pub version: String,
    pub status: OverallStatus,
    pub probes: Vec<ProbeResult>,
}

impl HealthSnapshot {
    /// True unless a critical probe failed.
    pub fn healthy(&self) -> bool {
        self.status != OverallStatus::Unhealthy
    }
}

impl IntoResponse for HealthSnapshot {
    fn into_response(self) -> Response {
        let code = if self.healthy() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (code, axum::Json(self)).into_response()
    }
}

/// Thread-safe collection of named health probes.
///
/// Shared by reference between the service and the operational
/// listener; registration is a startup-time operation, evaluation is
/// concurrent and lock-free beyond the probe-list snapshot.
pub struct HealthRegistry {
    service_name: String,
    version: String,
    probes: RwLock<Vec<HealthProbe>>,
}

impl HealthRegistry {
    pub fn new(service_name: &str, version: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            version: version.to_string(),
            probes: RwLock::new(Vec::new()),
        }
    }

    /// Register a probe under a unique name.
    ///
    /// # Errors
    /// Returns [`HealthError::AlreadyExists`] on a duplicate name; the
    /// existing probe is untouched.
    pub fn register(&self, probe: HealthProbe) -> Result<(), HealthError> {
        let mut probes = self.probes.write().expect("health registry lock poisoned");
        if probes.iter().any(|p| p.name == probe.name) {
            return Err(HealthError::AlreadyExists { name: probe.name });
        }
        debug!(
            probe = %probe.name,
            critical = probe.critical,
            timeout_ms = probe.timeout.as_millis() as u64,
            "health probe registered"
        );
        probes.push(probe);
        Ok(())
    }

    /// Number of registered probes.
    pub fn probe_count(&self) -> usize {
        self.probes.read().expect("health registry lock poisoned").len()
    }

    /// Evaluate every registered probe concurrently.
    ///
    /// Each probe is bounded by the smaller of its own timeout and
    /// `deadline`; a probe that exceeds its budget counts as failed for
    /// this evaluation only. An empty registry reports healthy so the
    /// operational surface stays available without custom checks.
    pub async fn evaluate(&self, deadline: Duration) -> HealthSnapshot {
        let probes: Vec<HealthProbe> = self
            .probes
            .read()
            .expect("health registry lock poisoned")
            .clone();

        let checks = probes.into_iter().map(|probe| async move {
            let budget = probe.timeout.min(deadline);
            let start = Instant::now();
            let outcome = tokio::time::timeout(budget, (probe.check)()).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            let (healthy, detail) = match outcome {
                Ok(Ok(())) => (true, None),
                Ok(Err(e)) => (false, Some(e.to_string())),
                Err(_) => (false, Some(format!("timed out after {budget:?}"))),
            };
            ProbeResult {
                name: probe.name,
                healthy,
                critical: probe.critical,
                detail,
                elapsed_ms,
            }
        });
        let results = join_all(checks).await;

        let critical_failure = results.iter().any(|r| !r.healthy && r.critical);
        let any_failure = results.iter().any(|r| !r.healthy);
        let status = if critical_failure {
            OverallStatus::Unhealthy
        } else if any_failure {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        if status == OverallStatus::Unhealthy {
            let failed: Vec<&str> = results
                .iter()
                .filter(|r| !r.healthy)
                .map(|r| r.name.as_str())
                .collect();
            warn!(service = %self.service_name, failed = ?failed, "health check failed");
        } else {
            debug!(service = %self.service_name, status = ?status, "health check ok");
        }

        HealthSnapshot {
            service: self.service_name.clone(),
            version: self.version.clone(),
            status,
            probes: results,
        }
    }

    /// True when no critical probe fails within `deadline`.
    pub async fn is_healthy(&self, deadline: Duration) -> bool {
        self.evaluate(deadline).await.healthy()
    }

    /// Readiness uses the full critical-probe evaluation.
    pub async fn is_ready(&self, deadline: Duration) -> bool {
        self.is_healthy(deadline).await
    }

    /// Liveness: the process is running. Stays true even when every
    /// registered probe fails, so transient downstream failure never
    /// triggers a restart.
    pub fn is_live(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HealthRegistry {
        HealthRegistry::new("testsvc", "0.0.0")
    }

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let health = registry();
        let snapshot = health.evaluate(DEADLINE).await;
        assert_eq!(snapshot.status, OverallStatus::Healthy);
        assert!(snapshot.healthy());
        assert!(snapshot.probes.is_empty());
    }

    #[tokio::test]
    async fn duplicate_probe_name_is_rejected() {
        let health = registry();
        health
            .register(HealthProbe::new("db", || async { Ok(()) }))
            .unwrap();
        let err = health
            .register(HealthProbe::new("db", || async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, HealthError::AlreadyExists { .. }));
        assert_eq!(health.probe_count(), 1);
    }

    #[tokio::test]
    async fn advisory_failure_degrades_but_stays_healthy() {
        let health = registry();
        health
            .register(HealthProbe::new("db", || async { Ok(()) }))
            .unwrap();
        health
            .register(
                HealthProbe::new("cache", || async { anyhow::bail!("cache down") }).advisory(),
            )
            .unwrap();

        let snapshot = health.evaluate(DEADLINE).await;
        assert_eq!(snapshot.status, OverallStatus::Degraded);
        assert!(snapshot.healthy());
        assert!(health.is_ready(DEADLINE).await);
    }

    #[tokio::test]
    async fn critical_failure_is_unhealthy_regardless_of_advisory() {
        let health = registry();
        health
            .register(HealthProbe::new("db", || async { anyhow::bail!("db down") }))
            .unwrap();
        health
            .register(HealthProbe::new("cache", || async { Ok(()) }).advisory())
            .unwrap();

        let snapshot = health.evaluate(DEADLINE).await;
        assert_eq!(snapshot.status, OverallStatus::Unhealthy);
        assert!(!snapshot.healthy());
        assert!(!health.is_ready(DEADLINE).await);

        let db = snapshot.probes.iter().find(|p| p.name == "db").unwrap();
        assert_eq!(db.detail.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn liveness_survives_failing_probes() {
        let health = registry();
        health
            .register(HealthProbe::new("db", || async { anyhow::bail!("down") }))
            .unwrap();
        assert!(health.is_live());
        assert!(!health.is_healthy(DEADLINE).await);
        assert!(health.is_live());
    }

    #[tokio::test]
    async fn slow_probe_fails_within_its_timeout() {
        let health = registry();
        health
            .register(
                HealthProbe::new("slow", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .timeout(Duration::from_millis(50)),
            )
            .unwrap();

        let start = Instant::now();
        let snapshot = health.evaluate(DEADLINE).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(snapshot.status, OverallStatus::Unhealthy);
        let slow = &snapshot.probes[0];
        assert!(slow.detail.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn evaluation_deadline_caps_probe_timeout() {
        let health = registry();
        health
            .register(
                HealthProbe::new("patient", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .timeout(Duration::from_secs(60)),
            )
            .unwrap();

        let start = Instant::now();
        let snapshot = health.evaluate(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!snapshot.healthy());
    }

    #[tokio::test]
    async fn snapshot_converts_to_http_status() {
        let healthy = HealthSnapshot {
            service: "s".into(),
            version: "v".into(),
            status: OverallStatus::Healthy,
            probes: vec![],
        };
        assert_eq!(healthy.into_response().status(), StatusCode::OK);

        let unhealthy = HealthSnapshot {
            service: "s".into(),
            version: "v".into(),
            status: OverallStatus::Unhealthy,
            probes: vec![],
        };
        assert_eq!(
            unhealthy.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
