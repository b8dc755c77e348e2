use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MetricsConfig;

/// Pull-model metrics sink fed by the dispatcher and the health checker.
pub struct MetricsCollector {
    enabled: bool,
    port: u16,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::describe_metrics();
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            enabled: config.enabled,
            port: config.port,
            prometheus_handle,
        })
    }

    /// A collector that records nothing. Used when metrics are disabled and
    /// by tests, which cannot install a second global recorder.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            port: 0,
            prometheus_handle: None,
        }
    }

    fn describe_metrics() {
        describe_counter!("http_requests_total", "Total number of HTTP requests by status");
        describe_histogram!(
            "http_request_duration_seconds",
            "Duration of HTTP requests in seconds"
        );
        describe_gauge!(
            "active_connections",
            "Number of in-flight requests per backend server"
        );
        describe_counter!(
            "health_checks_total",
            "Total number of health probes by result"
        );
    }

    /// Serve the Prometheus text exposition on the configured port until the
    /// shutdown token fires.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };

        let app = Router::new()
            .route("/metrics", get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind metrics server on {}: {}", addr, e))?;

        info!("Metrics server listening on {}/metrics", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))?;

        Ok(())
    }

    pub fn record_request(&self, status: u16, duration: Duration) {
        if !self.enabled {
            return;
        }

        counter!("http_requests_total", "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn connection_opened(&self, server: &str) {
        if !self.enabled {
            return;
        }

        gauge!("active_connections", "server" => server.to_string()).increment(1.0);
    }

    pub fn connection_closed(&self, server: &str) {
        if !self.enabled {
            return;
        }

        gauge!("active_connections", "server" => server.to_string()).decrement(1.0);
    }

    pub fn record_health_check(&self, healthy: bool) {
        if !self.enabled {
            return;
        }

        let result = if healthy { "success" } else { "failure" };
        counter!("health_checks_total", "result" => result).increment(1);
    }
}
