//! End-to-end tests driving a running service over real sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use servicekit::{
    path_param, HealthProbe, LifecycleState, Service, ServiceConfig, ServiceError, ShutdownHandle,
};

struct RunningService {
    addr: SocketAddr,
    ops_addr: SocketAddr,
    handle: ShutdownHandle,
    lifecycle: JoinHandle<Result<(), ServiceError>>,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl RunningService {
    async fn spawn(service: Service) -> Self {
        init_tracing();
        let primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ops = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = primary.local_addr().unwrap();
        let ops_addr = ops.local_addr().unwrap();
        let handle = service.shutdown_handle();
        let lifecycle = tokio::spawn(service.start_with_listeners(primary, ops));

        // Wait for the operational listener to answer.
        let live = format!("http://{ops_addr}/live");
        for _ in 0..50 {
            if reqwest::get(&live).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            addr,
            ops_addr,
            handle,
            lifecycle,
        }
    }

    async fn stop(self) -> Result<(), ServiceError> {
        self.handle.shutdown();
        self.lifecycle.await.unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn ops_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.ops_addr)
    }
}

fn test_service(name: &str) -> Service {
    Service::new(name, ServiceConfig::default()).unwrap()
}

#[tokio::test]
async fn serves_handlers_with_path_parameters() {
    let mut service = test_service("e2e_routes");
    service.handle("/hello/:name", |mut req| async move {
        let name = path_param(&mut req, "name").await.unwrap_or_default();
        format!("Hello, {name}!")
    });
    let running = RunningService::spawn(service).await;

    let response = reqwest::get(running.url("/hello/world")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello, world!");

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn operational_surface_reports_metrics_and_health() {
    let mut service = test_service("e2e_ops");
    service
        .register_probe(HealthProbe::new("self", || async { Ok(()) }))
        .unwrap();
    service.handle("/work", |_req| async { "done" });
    let running = RunningService::spawn(service).await;

    // Generate one request so the built-in series have samples.
    reqwest::get(running.url("/work")).await.unwrap();

    let health = reqwest::get(running.ops_url("/health")).await.unwrap();
    assert_eq!(health.status().as_u16(), 200);
    let payload = health.text().await.unwrap();
    assert!(payload.contains("\"status\":\"healthy\""));
    assert!(payload.contains("\"self\""));

    let ready = reqwest::get(running.ops_url("/ready")).await.unwrap();
    assert_eq!(ready.status().as_u16(), 200);
    let live = reqwest::get(running.ops_url("/live")).await.unwrap();
    assert_eq!(live.status().as_u16(), 200);

    let metrics = reqwest::get(running.ops_url("/metrics")).await.unwrap();
    assert_eq!(metrics.status().as_u16(), 200);
    let text = metrics.text().await.unwrap();
    assert!(text.contains("e2e_ops_http_requests_total"));
    assert!(text.contains("e2e_ops_http_request_duration_seconds"));
    assert!(text.contains("e2e_ops_http_requests_in_flight"));

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn panicking_handler_answers_500_and_keeps_serving() {
    let mut service = test_service("e2e_panic");
    service.handle::<_, _, ()>("/boom", |_req| async { panic!("handler blew up") });
    service.handle("/ok", |_req| async { "fine" });
    let running = RunningService::spawn(service).await;

    let boom = reqwest::get(running.url("/boom")).await.unwrap();
    assert_eq!(boom.status().as_u16(), 500);
    assert_eq!(boom.text().await.unwrap(), "Internal Server Error");

    let ok = reqwest::get(running.url("/ok")).await.unwrap();
    assert_eq!(ok.status().as_u16(), 200);

    // The failure was counted and the in-flight gauge released.
    let text = reqwest::get(running.ops_url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("status=\"5xx\""));
    assert!(text.contains("e2e_panic_http_requests_in_flight 0"));

    assert!(running.stop().await.is_ok());
}

#[tokio::test]
async fn shutdown_runs_hooks_and_reaches_stopped() {
    let service = test_service("e2e_shutdown");
    let hook_ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let hook_ran = Arc::clone(&hook_ran);
        service.add_shutdown_hook(move || async move {
            hook_ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let running = RunningService::spawn(service).await;
    assert_eq!(running.handle.state(), LifecycleState::Running);

    let handle = running.handle.clone();
    assert!(running.stop().await.is_ok());
    assert_eq!(hook_ran.load(Ordering::SeqCst), 2);
    assert_eq!(handle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn failing_hook_does_not_fail_shutdown() {
    let service = test_service("e2e_hook_err");
    service.add_shutdown_hook(|| async { anyhow::bail!("cleanup failed") });
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in_hook = Arc::clone(&ran);
    service.add_shutdown_hook(move || async move {
        ran_in_hook.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let running = RunningService::spawn(service).await;
    assert!(running.stop().await.is_ok());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bind_conflict_surfaces_before_serving() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = ServiceConfig {
        addr: addr.to_string(),
        ops_addr: "127.0.0.1:0".to_string(),
        ..ServiceConfig::default()
    };
    let service = Service::new("e2e_bind", config).unwrap();

    let err = service.start().await.unwrap_err();
    match err {
        ServiceError::Bind { addr: failed, .. } => assert_eq!(failed, addr.to_string()),
        other => panic!("expected bind error, got {other}"),
    }
}

#[tokio::test]
async fn requests_in_flight_drain_before_stop() {
    let mut service = test_service("e2e_drain");
    service.handle("/slowish", |_req| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        "finished"
    });
    let running = RunningService::spawn(service).await;

    let url = running.url("/slowish");
    let in_flight = tokio::spawn(async move { reqwest::get(url).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    running.handle.shutdown();
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "finished");
    assert!(running.lifecycle.await.unwrap().is_ok());
}
