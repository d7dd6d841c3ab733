//! Ordered middleware composition over boxed tower services.
//!
//! A link transforms one handler into another, mirroring the classic
//! `func(Handler) -> Handler` shape. [`MiddlewareChain::apply`] wraps a
//! handler with the links in reverse registration order, so the
//! first-registered link is outermost: it sees the request first and
//! the response last.
//!
//! The built-in chain, outermost first:
//! metrics capture -> span injection -> panic recovery -> request logging.
//! Metrics must wrap recovery so duration and status are recorded
//! exactly once per request using the post-recovery status (500 when
//! the handler panicked), and the in-flight gauge is released through
//! a drop guard even when a panic unwinds past recovery.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, RawPathParams, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tower::util::BoxCloneService;
use tower::{service_fn, ServiceExt};
use tracing::{debug, error, info, Instrument, Span};

use crate::metrics::MetricsRegistry;

/// A request handler with its response fully materialized.
pub type BoxedHandler = BoxCloneService<Request, Response, Infallible>;

/// A function transforming one handler into another.
pub type Middleware = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync>;

/// Request-scoped span stored in request extensions by the span
/// injection link.
#[derive(Clone)]
struct RequestSpan(Span);

/// Ordered, clone-on-register middleware composition.
///
/// The chain is captured into each route when the route is registered;
/// links appended afterwards only affect later registrations.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    links: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a link to the chain.
    pub fn use_link(&mut self, link: Middleware) {
        self.links.push(link);
    }

    /// Wrap `handler` with every link, first registered outermost.
    pub fn apply(&self, handler: BoxedHandler) -> BoxedHandler {
        self.links.iter().rev().fold(handler, |inner, link| link(inner))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// The default chain wired by the service: metrics capture, span
/// injection, panic recovery, request logging.
pub(crate) fn default_chain(metrics: Arc<MetricsRegistry>) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new();
    chain.use_link(metrics_capture(metrics));
    chain.use_link(span_injection());
    chain.use_link(panic_recovery());
    chain.use_link(request_logging());
    chain
}

/// Box a plain async handler function into a [`BoxedHandler`].
pub fn handler_fn<H, Fut, R>(handler: H) -> BoxedHandler
where
    H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = R> + Send + 'static,
    R: IntoResponse + 'static,
{
    BoxCloneService::new(service_fn(move |req: Request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler(req).await.into_response()) }
    }))
}

/// Build a link from an async function over (request, inner handler).
pub fn link<F, Fut>(f: F) -> Middleware
where
    F: Fn(Request, BoxedHandler) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response> + Send + 'static,
{
    Arc::new(move |inner: BoxedHandler| {
        let f = f.clone();
        BoxCloneService::new(service_fn(move |req: Request| {
            let f = f.clone();
            let inner = inner.clone();
            async move { Ok::<_, Infallible>(f(req, inner).await) }
        }))
    })
}

pub(crate) fn into_ok(result: Result<Response, Infallible>) -> Response {
    match result {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Maps a status code to its class label: "2xx", "5xx", ...
fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "other",
    }
}

/// Outermost link: in-flight tracking plus request count and duration,
/// recorded once per request with the post-recovery status. Also makes
/// the shared registry available to handlers through extensions.
pub fn metrics_capture(metrics: Arc<MetricsRegistry>) -> Middleware {
    link(move |mut req: Request, inner: BoxedHandler| {
        let metrics = Arc::clone(&metrics);
        async move {
            let method = req.method().to_string();
            // Prefer the matched route pattern over the raw path to
            // keep label cardinality bounded.
            let path = req
                .extensions()
                .get::<MatchedPath>()
                .map_or_else(|| req.uri().path().to_owned(), |m| m.as_str().to_owned());

            req.extensions_mut().insert(Arc::clone(&metrics));

            // Dropped on every exit path, including unwinding panics.
            let _guard = metrics.inflight_guard();
            let start = Instant::now();

            let response = into_ok(inner.oneshot(req).await);

            metrics.record_request(
                &method,
                &path,
                status_class(response.status()),
                start.elapsed().as_secs_f64(),
            );
            response
        }
    })
}

/// Injects a request-scoped span into extensions and instruments the
/// rest of the chain with it.
pub fn span_injection() -> Middleware {
    link(|mut req: Request, inner: BoxedHandler| {
        let span = tracing::info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
        );
        req.extensions_mut().insert(RequestSpan(span.clone()));
        async move { into_ok(inner.oneshot(req).await) }.instrument(span)
    })
}

/// Converts an unwinding panic from the inner handler into a plain 500
/// response. The panic is logged with request context and never
/// reaches the serving task.
pub fn panic_recovery() -> Middleware {
    link(|req: Request, inner: BoxedHandler| {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        async move {
            match AssertUnwindSafe(inner.oneshot(req)).catch_unwind().await {
                Ok(result) => into_ok(result),
                Err(panic) => {
                    error!(
                        method = %method,
                        path = %path,
                        panic = %panic_message(&*panic),
                        "panic recovered"
                    );
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
                }
            }
        }
    })
}

/// Innermost built-in link: logs each request as it arrives and its
/// outcome once handled.
pub fn request_logging() -> Middleware {
    link(|req: Request, inner: BoxedHandler| {
        let method = req.method().to_string();
        let path = req.uri().path().to_owned();
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_owned();
        async move {
            info!(method = %method, path = %path, user_agent = %user_agent, "incoming request");
            let start = Instant::now();
            let response = into_ok(inner.oneshot(req).await);
            debug!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );
            response
        }
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The span injected for the current request, or a disabled span when
/// the handler runs outside the default chain.
pub fn request_span(req: &Request) -> Span {
    req.extensions()
        .get::<RequestSpan>()
        .map_or_else(Span::none, |s| s.0.clone())
}

/// The metrics registry shared with the current request, or a detached
/// no-op registry when the handler runs outside the default chain, so
/// handler code never has to deal with absence.
pub fn request_metrics(req: &Request) -> Arc<MetricsRegistry> {
    static FALLBACK: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
    req.extensions()
        .get::<Arc<MetricsRegistry>>()
        .cloned()
        .unwrap_or_else(|| {
            Arc::clone(FALLBACK.get_or_init(|| {
                Arc::new(
                    MetricsRegistry::new("detached").expect("fallback registry must construct"),
                )
            }))
        })
}

/// Extract a named path parameter captured by the route pattern.
pub async fn path_param(req: &mut Request, name: &str) -> Option<String> {
    use axum::RequestExt;
    let params = req.extract_parts::<RawPathParams>().await.ok()?;
    params
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_owned())
}
