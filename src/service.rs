//! Service lifecycle: two listeners, ordered startup, graceful shutdown.
//!
//! A [`Service`] owns an application router on the primary listener and
//! the metrics/health surface on the operational listener. Startup is
//! all-or-nothing: both sockets bind before either serves. Shutdown is
//! triggered by SIGTERM/SIGINT, a [`ShutdownHandle`], or a listener
//! failure, and proceeds in order: run shutdown hooks, drain both
//! listeners, all under one configurable budget.
//!
//! [`Service::start`] consumes the service, so routes and middleware
//! cannot change once traffic is flowing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::any_service;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{HealthError, MetricsError, ServiceError};
use crate::health::{HealthProbe, HealthRegistry};
use crate::metrics::{MetricSpec, MetricsRegistry};
use crate::middleware::{self, handler_fn, link, BoxedHandler, Middleware, MiddlewareChain};
use crate::ops::ops_router;
use crate::shutdown::ShutdownSequencer;

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Remotely observes and stops a running service.
///
/// Handles stay valid after the service task finishes; triggering
/// shutdown twice is harmless.
#[derive(Clone)]
pub struct ShutdownHandle {
    trigger: broadcast::Sender<()>,
    state: Arc<AtomicU8>,
}

impl ShutdownHandle {
    /// Request a graceful shutdown. Returns immediately; the service
    /// drains within its configured budget.
    pub fn shutdown(&self) {
        // Fails only when the lifecycle already finished.
        let _ = self.trigger.send(());
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// An HTTP service with built-in metrics, health, and shutdown plumbing.
pub struct Service {
    name: String,
    config: ServiceConfig,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthRegistry>,
    chain: MiddlewareChain,
    router: Router,
    hooks: Arc<ShutdownSequencer>,
    state: Arc<AtomicU8>,
    trigger: broadcast::Sender<()>,
}

impl Service {
    /// Create a service with the default middleware chain.
    ///
    /// # Errors
    /// Fails when the configuration is invalid or the built-in metric
    /// series cannot be constructed (a name that is not a valid metric
    /// identifier).
    pub fn new(name: &str, config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate().map_err(ServiceError::Config)?;
        let metrics = Arc::new(MetricsRegistry::new(name)?);
        let health = Arc::new(HealthRegistry::new(name, &config.version));
        let chain = middleware::default_chain(Arc::clone(&metrics));
        let (trigger, _) = broadcast::channel(1);

        Ok(Self {
            name: name.to_string(),
            config,
            metrics,
            health,
            chain,
            router: Router::new(),
            hooks: Arc::new(ShutdownSequencer::new()),
            state: Arc::new(AtomicU8::new(LifecycleState::Idle as u8)),
            trigger,
        })
    }

    /// Service name, used as the metric name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Shared metrics registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Shared health registry.
    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    /// A handle that can observe and stop the service after
    /// [`start`](Self::start) has consumed it.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            trigger: self.trigger.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Append a middleware link to the chain.
    ///
    /// The chain is captured into each route at registration time, so
    /// links added here only wrap routes registered afterwards.
    pub fn use_middleware(&mut self, link: Middleware) {
        self.chain.use_link(link);
    }

    /// Register a handler on the primary listener.
    ///
    /// The handler answers every HTTP method on `path` and is wrapped
    /// with the current middleware chain plus a per-request budget: a
    /// handler that outlives the configured write timeout is answered
    /// with 408 and its work discarded.
    pub fn handle<H, Fut, R>(&mut self, path: &str, handler: H)
    where
        H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoResponse + 'static,
    {
        let budgeted = handler_budget(self.config.write_timeout())(handler_fn(handler));
        let composed = self.chain.apply(budgeted);
        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, any_service(composed));
    }

    /// Register a counter with [`MetricSpec`] name, help, and labels.
    pub fn register_counter(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        self.metrics.register_counter(spec)
    }

    pub fn register_gauge(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        self.metrics.register_gauge(spec)
    }

    pub fn register_histogram(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        self.metrics.register_histogram(spec)
    }

    pub fn register_summary(&self, spec: &MetricSpec) -> Result<(), MetricsError> {
        self.metrics.register_summary(spec)
    }

    /// Register a health probe evaluated by the operational endpoints.
    pub fn register_probe(&self, probe: HealthProbe) -> Result<(), HealthError> {
        self.health.register(probe)
    }

    /// Register a cleanup action to run during graceful shutdown, in
    /// registration order.
    pub fn add_shutdown_hook<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.add_hook(hook);
    }

    /// Bind both listeners and serve until shutdown completes.
    ///
    /// # Errors
    /// A bind failure is returned immediately, before any task spawns.
    /// After startup, the first listener failure or shutdown error is
    /// returned once draining finishes.
    pub async fn start(self) -> Result<(), ServiceError> {
        let primary = TcpListener::bind(&self.config.addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.config.addr.clone(),
                source,
            })?;
        let ops = TcpListener::bind(&self.config.ops_addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.config.ops_addr.clone(),
                source,
            })?;
        self.run(primary, ops).await
    }

    /// Serve on pre-bound listeners. Useful when the caller binds to
    /// an ephemeral port and needs the address before startup.
    pub async fn start_with_listeners(
        self,
        primary: TcpListener,
        ops: TcpListener,
    ) -> Result<(), ServiceError> {
        self.run(primary, ops).await
    }

    async fn run(self, primary: TcpListener, ops: TcpListener) -> Result<(), ServiceError> {
        if self
            .state
            .compare_exchange(
                LifecycleState::Idle as u8,
                LifecycleState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ServiceError::AlreadyStarted);
        }

        let primary_addr = primary.local_addr().ok();
        let ops_addr = ops.local_addr().ok();

        let ops_routes = ops_router(&self.config, Arc::clone(&self.metrics), Arc::clone(&self.health));

        let (drain_tx, _) = broadcast::channel::<()>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<(&'static str, std::io::Error)>(2);

        let mut listeners = vec![
            (
                "primary",
                spawn_listener(
                    "primary",
                    primary,
                    self.router.clone(),
                    drain_tx.subscribe(),
                    error_tx.clone(),
                ),
            ),
            (
                "operational",
                spawn_listener(
                    "operational",
                    ops,
                    ops_routes,
                    drain_tx.subscribe(),
                    error_tx,
                ),
            ),
        ];

        self.state
            .store(LifecycleState::Running as u8, Ordering::SeqCst);
        info!(
            service = %self.name,
            addr = ?primary_addr,
            ops_addr = ?ops_addr,
            "service started"
        );

        let mut external = self.trigger.subscribe();
        let mut serve_error: Option<ServiceError> = None;
        tokio::select! {
            () = terminate_signal() => {
                info!(service = %self.name, "termination signal received");
            }
            _ = external.recv() => {
                info!(service = %self.name, "shutdown requested");
            }
            Some((listener, source)) = error_rx.recv() => {
                error!(service = %self.name, listener, error = %source, "listener failed");
                serve_error = Some(ServiceError::Listener { listener, source });
            }
        }

        self.state
            .store(LifecycleState::ShuttingDown as u8, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.shutdown_timeout();

        // Hooks first: release application resources while the
        // listeners are still accepting, then drain.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let hook_failures = self.hooks.run(remaining).await;
        if hook_failures > 0 {
            warn!(service = %self.name, failures = hook_failures, "shutdown hooks failed");
        }

        let _ = drain_tx.send(());
        let mut shutdown_error: Option<ServiceError> = None;
        for (listener, handle) in &mut listeners {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut *handle).await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    error!(service = %self.name, listener = *listener, error = %source, "listener task failed");
                    shutdown_error.get_or_insert(ServiceError::ListenerTask {
                        listener: *listener,
                        source,
                    });
                }
                Err(_) => {
                    warn!(service = %self.name, listener = *listener, "listener did not drain in time, aborting");
                    handle.abort();
                    shutdown_error
                        .get_or_insert(ServiceError::ShutdownTimeout { listener: *listener });
                }
            }
        }

        // A serve failure that raced the shutdown trigger still counts.
        if serve_error.is_none() {
            if let Ok((listener, source)) = error_rx.try_recv() {
                serve_error = Some(ServiceError::Listener { listener, source });
            }
        }

        self.state
            .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
        info!(service = %self.name, "service stopped");

        match serve_error.or(shutdown_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Wraps a handler with a response deadline; 408 on elapse.
fn handler_budget(budget: Duration) -> Middleware {
    use tower::ServiceExt;
    link(move |req: Request, inner: BoxedHandler| async move {
        match tokio::time::timeout(budget, inner.oneshot(req)).await {
            Ok(result) => middleware::into_ok(result),
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "handler exceeded response budget");
                (StatusCode::REQUEST_TIMEOUT, "Request Timeout").into_response()
            }
        }
    })
}

fn spawn_listener(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut drain: broadcast::Receiver<()>,
    errors: mpsc::Sender<(&'static str, std::io::Error)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = drain.recv().await;
            })
            .await;
        if let Err(source) = result {
            // The lifecycle task turns this into a ServiceError.
            let _ = errors.send((name, source)).await;
        }
    })
}

/// Resolves when the process receives SIGTERM or SIGINT.
#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Service {
        Service::new("lifecycletest", ServiceConfig::default()).unwrap()
    }

    #[test]
    fn new_service_is_idle() {
        let svc = service();
        assert_eq!(svc.shutdown_handle().state(), LifecycleState::Idle);
        assert_eq!(svc.name(), "lifecycletest");
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = ServiceConfig {
            addr: "nonsense".to_string(),
            ..ServiceConfig::default()
        };
        let err = Service::new("bad", config).err().unwrap();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn registrations_delegate_with_conflict_errors() {
        let svc = service();
        let spec = MetricSpec::new("jobs_total", "Jobs processed").labels(&["kind"]);
        svc.register_counter(&spec).unwrap();
        assert!(matches!(
            svc.register_counter(&spec),
            Err(MetricsError::AlreadyExists { .. })
        ));

        svc.register_probe(HealthProbe::new("db", || async { Ok(()) }))
            .unwrap();
        assert!(matches!(
            svc.register_probe(HealthProbe::new("db", || async { Ok(()) })),
            Err(HealthError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn handle_registers_route_through_the_chain() {
        use axum::body::Body;
        use tower::ServiceExt;

        let mut svc = service();
        svc.handle("/ping", |_req| async { "pong" });

        let response = svc
            .router
            .clone()
            .oneshot(
                axum::http::Request::get("/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // The default chain recorded the request against the shared registry.
        let families = svc.metrics().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "lifecycletest_http_requests_total"));
    }

    #[tokio::test]
    async fn slow_handler_is_answered_with_408() {
        use axum::body::Body;
        use tower::ServiceExt;

        let config = ServiceConfig {
            write_timeout_secs: 1,
            ..ServiceConfig::default()
        };
        let mut svc = Service::new("slowtest", config).unwrap();
        svc.handle("/slow", |_req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "done"
        });

        tokio::time::pause();
        let pending = svc.router.clone().oneshot(
            axum::http::Request::get("/slow")
                .body(Body::empty())
                .unwrap(),
        );
        let response = pending.await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let svc = service();
        svc.state
            .store(LifecycleState::Running as u8, Ordering::SeqCst);
        let primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ops = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = svc.start_with_listeners(primary, ops).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyStarted));
    }
}
