//! Metrics registry with a flexible, service-prefixed namespace.
//!
//! Wraps an owned `prometheus::Registry` (never the process-global
//! default) and adds:
//! - built-in HTTP series (request count, duration, in-flight gauge)
//!   created unconditionally at construction,
//! - dynamic registration of counters, gauges, histograms, and
//!   summaries under the service-name prefix,
//! - observation operations addressed by bare or prefixed name.
//!
//! Registration is rare (startup) and takes the write lock; the
//! per-request observation path only takes a read lock for the name
//! lookup, and the underlying series mutation is atomic inside the
//! prometheus types. Exporting gathers a snapshot without blocking
//! writers for the duration of serialization.

use std::collections::HashMap;
use std::sync::RwLock;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::error::MetricsError;
use crate::summary::{SummaryVec, DEFAULT_OBJECTIVES};

/// Descriptor for a user-registered metric.
///
/// `buckets` applies to histograms, `objectives` (quantile, tolerance)
/// to summaries; both fall back to library defaults when empty.
#[derive(Debug, Clone, Default)]
pub struct MetricSpec {
    pub name: String,
    pub help: String,
    pub labels: Vec<String>,
    pub buckets: Vec<f64>,
    pub objectives: Vec<(f64, f64)>,
}

impl MetricSpec {
    /// Create a descriptor with no labels and default parameters.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            ..Self::default()
        }
    }

    /// Set the ordered label names.
    #[must_use]
    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| (*l).to_string()).collect();
        self
    }

    /// Set histogram bucket boundaries.
    #[must_use]
    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set summary (quantile, error-tolerance) objectives.
    #[must_use]
    pub fn objectives(mut self, objectives: Vec<(f64, f64)>) -> Self {
        self.objectives = objectives;
        self
    }
}

/// Decrements the in-flight gauge when dropped, so the count is
/// restored even when the guarded request handler panics.
pub(crate) struct InFlightGuard(IntGauge);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Map a metric construction failure to an `InvalidDescriptor` error.
fn invalid(name: &str, e: &prometheus::Error) -> MetricsError {
    MetricsError::InvalidDescriptor {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

/// Thread-safe metric store shared by every request task and the
/// operational listener.
pub struct MetricsRegistry {
    service_name: String,
    registry: Registry,

    // Built-in HTTP series, always present.
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_requests_in_flight: IntGauge,

    counters: RwLock<HashMap<String, CounterVec>>,
    gauges: RwLock<HashMap<String, GaugeVec>>,
    histograms: RwLock<HashMap<String, HistogramVec>>,
    summaries: RwLock<HashMap<String, SummaryVec>>,
}

impl MetricsRegistry {
    /// Create a registry with the built-in HTTP series registered.
    ///
    /// # Errors
    /// Fails only if the service name produces invalid metric names.
    pub fn new(service_name: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                format!("{service_name}_http_requests_total"),
                "Total number of HTTP requests",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{service_name}_http_request_duration_seconds"),
                "HTTP request duration in seconds",
            )
            .buckets(prometheus::DEFAULT_BUCKETS.to_vec()),
            &["method", "path", "status"],
        )?;

        let http_requests_in_flight = IntGauge::new(
            format!("{service_name}_http_requests_in_flight"),
            "Number of HTTP requests currently being processed",
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;

        Ok(Self {
            service_name: service_name.to_string(),
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            summaries: RwLock::new(HashMap::new()),
        })
    }

    /// Register a counter metric.
    pub fn register_counter(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        let name = self.validated_name(&spec.name)?;
        let mut counters = self.counters.write().expect("metrics registry lock poisoned");
        if counters.contains_key(&name) {
            return Err(MetricsError::AlreadyExists { name });
        }

        let label_refs: Vec<&str> = spec.labels.iter().map(String::as_str).collect();
        let counter = CounterVec::new(Opts::new(&name, &spec.help), &label_refs)
            .map_err(|e| invalid(&name, &e))?;
        self.register_collector(&name, Box::new(counter.clone()))?;
        counters.insert(name, counter);
        Ok(())
    }

    /// Register a gauge metric.
    pub fn register_gauge(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        let name = self.validated_name(&spec.name)?;
        let mut gauges = self.gauges.write().expect("metrics registry lock poisoned");
        if gauges.contains_key(&name) {
            return Err(MetricsError::AlreadyExists { name });
        }

        let label_refs: Vec<&str> = spec.labels.iter().map(String::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(&name, &spec.help), &label_refs)
            .map_err(|e| invalid(&name, &e))?;
        self.register_collector(&name, Box::new(gauge.clone()))?;
        gauges.insert(name, gauge);
        Ok(())
    }

    /// Register a histogram metric. Empty buckets fall back to the
    /// prometheus defaults.
    pub fn register_histogram(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        let name = self.validated_name(&spec.name)?;
        let mut histograms = self
            .histograms
            .write()
            .expect("metrics registry lock poisoned");
        if histograms.contains_key(&name) {
            return Err(MetricsError::AlreadyExists { name });
        }

        let buckets = if spec.buckets.is_empty() {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            spec.buckets.clone()
        };
        let label_refs: Vec<&str> = spec.labels.iter().map(String::as_str).collect();
        let histogram = HistogramVec::new(
            HistogramOpts::new(&name, &spec.help).buckets(buckets),
            &label_refs,
        )
        .map_err(|e| invalid(&name, &e))?;
        self.register_collector(&name, Box::new(histogram.clone()))?;
        histograms.insert(name, histogram);
        Ok(())
    }

    /// Register a summary metric. Empty objectives fall back to
    /// {0.5: 5%, 0.9: 1%, 0.99: 0.1%}.
    pub fn register_summary(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        let name = self.validated_name(&spec.name)?;
        let mut summaries = self
            .summaries
            .write()
            .expect("metrics registry lock poisoned");
        if summaries.contains_key(&name) {
            return Err(MetricsError::AlreadyExists { name });
        }

        let objectives = if spec.objectives.is_empty() {
            DEFAULT_OBJECTIVES.to_vec()
        } else {
            spec.objectives.clone()
        };
        let summary = SummaryVec::new(&name, &spec.help, &spec.labels, objectives)
            .map_err(|e| invalid(&name, &e))?;
        self.register_collector(&name, Box::new(summary.clone()))?;
        summaries.insert(name, summary);
        Ok(())
    }

    /// Increment a counter by 1.
    pub fn inc_counter(&self, name: &str, label_values: &[&str]) -> Result<(), MetricsError> {
        self.add_counter(name, 1.0, label_values)
    }

    /// Add a value to a counter.
    pub fn add_counter(
        &self,
        name: &str,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), MetricsError> {
        let name = self.prefixed(name);
        let counters = self.counters.read().expect("metrics registry lock poisoned");
        let counter = counters
            .get(&name)
            .ok_or_else(|| MetricsError::NotFound { name: name.clone() })?;
        counter
            .get_metric_with_label_values(label_values)
            .map_err(|source| MetricsError::InvalidLabels { name, source })?
            .inc_by(value);
        Ok(())
    }

    /// Set a gauge to a value.
    pub fn set_gauge(
        &self,
        name: &str,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), MetricsError> {
        self.with_gauge(name, label_values, |g| g.set(value))
    }

    /// Increment a gauge by 1.
    pub fn inc_gauge(&self, name: &str, label_values: &[&str]) -> Result<(), MetricsError> {
        self.with_gauge(name, label_values, |g| g.inc())
    }

    /// Decrement a gauge by 1.
    pub fn dec_gauge(&self, name: &str, label_values: &[&str]) -> Result<(), MetricsError> {
        self.with_gauge(name, label_values, |g| g.dec())
    }

    /// Add a value to a gauge.
    pub fn add_gauge(
        &self,
        name: &str,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), MetricsError> {
        self.with_gauge(name, label_values, |g| g.add(value))
    }

    /// Observe a value in a histogram.
    pub fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), MetricsError> {
        let name = self.prefixed(name);
        let histograms = self
            .histograms
            .read()
            .expect("metrics registry lock poisoned");
        let histogram = histograms
            .get(&name)
            .ok_or_else(|| MetricsError::NotFound { name: name.clone() })?;
        histogram
            .get_metric_with_label_values(label_values)
            .map_err(|source| MetricsError::InvalidLabels { name, source })?
            .observe(value);
        Ok(())
    }

    /// Observe a value in a summary.
    pub fn observe_summary(
        &self,
        name: &str,
        value: f64,
        label_values: &[&str],
    ) -> Result<(), MetricsError> {
        let name = self.prefixed(name);
        let summaries = self
            .summaries
            .read()
            .expect("metrics registry lock poisoned");
        let summary = summaries
            .get(&name)
            .ok_or_else(|| MetricsError::NotFound { name: name.clone() })?;
        summary
            .observe(label_values, value)
            .map_err(|source| MetricsError::InvalidLabels { name, source })?;
        Ok(())
    }

    /// Snapshot every registered series.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn export_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    /// Current value of the in-flight request gauge.
    pub fn in_flight(&self) -> i64 {
        self.http_requests_in_flight.get()
    }

    /// Service name used as the metric prefix.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn inflight_guard(&self) -> InFlightGuard {
        self.http_requests_in_flight.inc();
        InFlightGuard(self.http_requests_in_flight.clone())
    }

    pub(crate) fn record_request(&self, method: &str, path: &str, status: &str, seconds: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, status])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path, status])
            .observe(seconds);
    }

    /// Prefix a bare name with the service name; already-prefixed
    /// names pass through unchanged.
    fn prefixed(&self, name: &str) -> String {
        if name.starts_with(&format!("{}_", self.service_name)) {
            name.to_string()
        } else {
            format!("{}_{name}", self.service_name)
        }
    }

    fn validated_name(&self, name: &str) -> Result<String, MetricsError> {
        if name.is_empty() {
            return Err(MetricsError::InvalidDescriptor {
                name: String::new(),
                reason: "metric name must not be empty".to_string(),
            });
        }
        let prefixed = self.prefixed(name);
        if self.is_reserved(&prefixed) {
            return Err(MetricsError::InvalidDescriptor {
                name: prefixed,
                reason: "name collides with a built-in HTTP metric".to_string(),
            });
        }
        Ok(prefixed)
    }

    fn is_reserved(&self, prefixed: &str) -> bool {
        let svc = &self.service_name;
        prefixed == format!("{svc}_http_requests_total")
            || prefixed == format!("{svc}_http_request_duration_seconds")
            || prefixed == format!("{svc}_http_requests_in_flight")
    }

    /// Register with the underlying prometheus registry, mapping a
    /// cross-kind name collision to `AlreadyExists`.
    fn register_collector(
        &self,
        name: &str,
        collector: Box<dyn prometheus::core::Collector>,
    ) -> Result<(), MetricsError> {
        self.registry.register(collector).map_err(|e| match e {
            prometheus::Error::AlreadyReg => MetricsError::AlreadyExists {
                name: name.to_string(),
            },
            other => MetricsError::Prometheus(other),
        })
    }

    fn with_gauge(
        &self,
        name: &str,
        label_values: &[&str],
        op: impl FnOnce(prometheus::Gauge),
    ) -> Result<(), MetricsError> {
        let name = self.prefixed(name);
        let gauges = self.gauges.read().expect("metrics registry lock poisoned");
        let gauge = gauges
            .get(&name)
            .ok_or_else(|| MetricsError::NotFound { name: name.clone() })?;
        let child = gauge
            .get_metric_with_label_values(label_values)
            .map_err(|source| MetricsError::InvalidLabels { name, source })?;
        op(child);
        Ok(())
    }
}
