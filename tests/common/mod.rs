#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;

use balancerd::backend::{Backend, BackendRegistry};
use balancerd::config::Algorithm;
use balancerd::observability::MetricsCollector;
use balancerd::proxy::{self, Balancer, CircuitBreaker, LoadBalancer, RateLimiter};

pub const GENEROUS_RATE: f64 = 10_000.0;
pub const GENEROUS_BURST: f64 = 10_000.0;

/// Serve an arbitrary axum router on an ephemeral port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// An origin that answers every path with a fixed body and 200 on /health.
pub async fn spawn_origin(body: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/health", axum::routing::get(|| async { "healthy" }))
        .fallback(move || async move { body });
    spawn_server(app).await
}

/// A bound-then-dropped listener yields an address with nothing listening.
pub async fn dead_origin_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub struct BalancerHandle {
    pub addr: SocketAddr,
    pub registry: Arc<BackendRegistry>,
}

impl BalancerHandle {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub struct BalancerOptions {
    pub algorithm: Algorithm,
    pub rate: f64,
    pub burst: f64,
    pub breaker_threshold: u32,
    pub breaker_timeout: Duration,
    pub request_deadline: Duration,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            rate: GENEROUS_RATE,
            burst: GENEROUS_BURST,
            breaker_threshold: 5,
            breaker_timeout: Duration::from_secs(10),
            request_deadline: Duration::from_secs(30),
        }
    }
}

/// Build and serve a balancer over the given backends on an ephemeral port.
pub async fn spawn_balancer(backends: &[SocketAddr], options: BalancerOptions) -> BalancerHandle {
    let registry = Arc::new(BackendRegistry::new());
    for addr in backends {
        registry
            .add(Arc::new(Backend::new(&format!("http://{}", addr)).unwrap()))
            .await
            .unwrap();
    }

    let policy = LoadBalancer::new(options.algorithm, registry.clone());
    let breaker = CircuitBreaker::new(options.breaker_threshold, options.breaker_timeout);
    let limiter = Arc::new(RateLimiter::new(options.rate, options.burst));
    let metrics = Arc::new(MetricsCollector::disabled());

    let balancer = Arc::new(
        Balancer::new(policy, breaker, limiter, metrics, options.request_deadline).unwrap(),
    );

    let addr = spawn_server(proxy::router(balancer)).await;
    BalancerHandle { addr, registry }
}
