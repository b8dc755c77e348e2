use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::observability::MetricsCollector;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic liveness prober. Each tick snapshots the registry and fans out
/// one concurrent probe per backend; write-backs go straight to the backend's
/// atomic fields, so the registry lock is never held across a probe.
pub struct HealthChecker {
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsCollector>,
    client: Client,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsCollector>,
        interval: Duration,
    ) -> Self {
        Self::with_probe_timeout(registry, metrics, interval, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsCollector>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("balancerd/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build health probe client");

        Self {
            registry,
            metrics,
            client,
            interval,
            probe_timeout,
        }
    }

    /// Run until the shutdown token fires. In-flight probes are bounded by
    /// the per-probe deadline, so cancellation is prompt.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "health checker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("health checker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Probe every backend in the current snapshot concurrently and wait for
    /// the tick's probes to settle.
    async fn sweep(&self) {
        let snapshot = self.registry.snapshot().await;

        let probes: Vec<_> = snapshot
            .into_iter()
            .map(|backend| {
                let client = self.client.clone();
                let metrics = self.metrics.clone();
                let probe_timeout = self.probe_timeout;
                tokio::spawn(async move {
                    probe(&client, &backend, probe_timeout, &metrics).await;
                })
            })
            .collect();

        for handle in probes {
            let _ = handle.await;
        }
    }
}

/// One liveness probe: GET the backend's health path under the probe
/// deadline. Success is status 200 or 204.
async fn probe(
    client: &Client,
    backend: &Arc<Backend>,
    probe_timeout: Duration,
    metrics: &MetricsCollector,
) {
    let url = backend.health_url();
    let started = Instant::now();

    let outcome = tokio::time::timeout(probe_timeout, client.get(&url).send()).await;

    match outcome {
        Ok(Ok(response))
            if response.status() == StatusCode::OK
                || response.status() == StatusCode::NO_CONTENT =>
        {
            let elapsed = started.elapsed();
            backend.record_probe_success(elapsed);
            metrics.record_health_check(true);
            debug!(
                url = %backend.url(),
                elapsed_ms = elapsed.as_millis() as u64,
                "health probe passed"
            );
        }
        Ok(Ok(response)) => {
            backend.record_probe_failure();
            metrics.record_health_check(false);
            warn!(
                url = %backend.url(),
                status = response.status().as_u16(),
                failures = backend.consecutive_failures(),
                "health probe failed"
            );
        }
        Ok(Err(e)) => {
            backend.record_probe_failure();
            metrics.record_health_check(false);
            warn!(
                url = %backend.url(),
                error = %e,
                failures = backend.consecutive_failures(),
                "health probe failed"
            );
        }
        Err(_) => {
            backend.record_probe_failure();
            metrics.record_health_check(false);
            warn!(
                url = %backend.url(),
                timeout_ms = probe_timeout.as_millis() as u64,
                failures = backend.consecutive_failures(),
                "health probe timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn spawn_origin(healthy: Arc<AtomicBool>) -> SocketAddr {
        let app = Router::new().route(
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
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn probe_demotes_and_recovers_backend() {
        let healthy = Arc::new(AtomicBool::new(false));
        let addr = spawn_origin(healthy.clone()).await;

        let backend = Arc::new(Backend::new(&format!("http://{}", addr)).unwrap());
        let client = Client::new();
        let metrics = MetricsCollector::disabled();

        probe(&client, &backend, Duration::from_secs(1), &metrics).await;
        assert!(!backend.is_active());
        assert_eq!(backend.consecutive_failures(), 1);

        healthy.store(true, Ordering::Release);
        probe(&client, &backend, Duration::from_secs(1), &metrics).await;
        assert!(backend.is_active());
        assert_eq!(backend.consecutive_failures(), 0);
        assert!(backend.status().last_checked.is_some());
    }

    #[tokio::test]
    async fn unreachable_backend_counts_as_failure() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = Arc::new(Backend::new(&format!("http://{}", addr)).unwrap());
        let client = Client::new();
        let metrics = MetricsCollector::disabled();

        probe(&client, &backend, Duration::from_secs(1), &metrics).await;
        assert!(!backend.is_active());
        assert!(backend.consecutive_failures() >= 1);
    }

    #[tokio::test]
    async fn checker_halts_on_shutdown() {
        let registry = Arc::new(BackendRegistry::new());
        let checker = HealthChecker::new(
            registry,
            Arc::new(MetricsCollector::disabled()),
            Duration::from_millis(50),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(checker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker did not halt on shutdown")
            .unwrap();
    }
}
