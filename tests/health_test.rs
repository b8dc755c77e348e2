mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;

use balancerd::health::HealthChecker;
use balancerd::observability::MetricsCollector;
use common::{spawn_balancer, BalancerOptions};

/// Origin whose /health handler can be flipped between 500 and 200.
async fn spawn_flippable_origin(healthy: Arc<AtomicBool>) -> std::net::SocketAddr {
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let healthy = healthy.clone();
                async move {
                    if healthy.load(Ordering::Acquire) {
                        axum::http::StatusCode::OK
                    } else {
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR
                    }
                }
            }),
        )
        .fallback(|| async { "origin" });
    common::spawn_server(app).await
}

#[tokio::test]
async fn unhealthy_backend_is_demoted_then_recovers() {
    let healthy = Arc::new(AtomicBool::new(false));
    let origin = spawn_flippable_origin(healthy.clone()).await;
    let balancer = spawn_balancer(&[origin], BalancerOptions::default()).await;

    let checker = HealthChecker::new(
        balancer.registry.clone(),
        Arc::new(MetricsCollector::disabled()),
        Duration::from_millis(100),
    );
    let shutdown = CancellationToken::new();
    let checker_task = tokio::spawn(checker.run(shutdown.clone()));

    // Two ticks are plenty to observe the failing probe.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let backend = &balancer.registry.snapshot().await[0];
    assert!(!backend.is_active());
    assert!(backend.consecutive_failures() >= 1);

    // A demoted pool rejects traffic.
    let response = reqwest::get(balancer.url("/")).await.unwrap();
    assert_eq!(response.status(), 503);

    // Flip the health handler; within two more ticks the backend is back.
    healthy.store(true, Ordering::Release);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(backend.is_active());
    assert_eq!(backend.consecutive_failures(), 0);

    let response = reqwest::get(balancer.url("/")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "origin");

    shutdown.cancel();
    let _ = checker_task.await;
}

#[tokio::test]
async fn probe_latency_feeds_response_time() {
    let healthy = Arc::new(AtomicBool::new(true));
    let origin = spawn_flippable_origin(healthy).await;
    let balancer = spawn_balancer(&[origin], BalancerOptions::default()).await;

    let checker = HealthChecker::new(
        balancer.registry.clone(),
        Arc::new(MetricsCollector::disabled()),
        Duration::from_millis(50),
    );
    let shutdown = CancellationToken::new();
    let checker_task = tokio::spawn(checker.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let backend = &balancer.registry.snapshot().await[0];
    assert!(backend.status().last_checked.is_some());
    // A local probe completes in well under the deadline but not instantly.
    assert!(backend.last_response_time() > Duration::ZERO);

    shutdown.cancel();
    let _ = checker_task.await;
}
