use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use balancerd::backend::{Backend, BackendRegistry};
use balancerd::config::Config;
use balancerd::health::HealthChecker;
use balancerd::observability::{self, MetricsCollector};
use balancerd::proxy::{self, Balancer, CircuitBreaker, LoadBalancer, RateLimiter};
use balancerd::tls;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BUCKET_IDLE_CUTOFF: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "balancerd")]
#[command(about = "A layer-7 reverse-proxy load balancer")]
struct Args {
    #[arg(short, long, default_value = "config/config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    observability::init_tracing(&config.logging)?;

    info!(
        algorithm = config.load_balancer.algorithm.as_str(),
        backends = config.backend_servers.len(),
        "starting balancerd"
    );

    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);

    let registry = Arc::new(BackendRegistry::new());
    for url in &config.backend_servers {
        let backend = Backend::new(url)
            .map_err(|e| anyhow::anyhow!("Invalid backend server '{}': {}", url, e))?;
        registry
            .add(Arc::new(backend))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register backend '{}': {}", url, e))?;
    }

    let policy = LoadBalancer::new(config.load_balancer.algorithm, registry.clone());
    let breaker = CircuitBreaker::default();
    let limiter = Arc::new(RateLimiter::default());

    let balancer = Arc::new(Balancer::new(
        policy,
        breaker,
        limiter.clone(),
        metrics.clone(),
        config.server.write_timeout,
    )?);

    let shutdown = CancellationToken::new();

    let checker = HealthChecker::new(
        registry.clone(),
        metrics.clone(),
        config.load_balancer.health_check_interval,
    );
    let health_task = tokio::spawn(checker.run(shutdown.clone()));

    // Idle rate-limit buckets are swept so the table does not grow with
    // every distinct source address ever seen.
    let sweeper_task = {
        let limiter = limiter.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BUCKET_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => limiter.evict_idle(BUCKET_IDLE_CUTOFF),
                }
            }
        })
    };

    let metrics_task = if config.metrics.enabled {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics.serve(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let app = proxy::router(balancer);

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen_addr))?;

    info!(
        addr = %config.server.listen_addr,
        tls = config.tls.enabled,
        "listening for connections"
    );

    let mut server_task = if config.tls.enabled {
        let server_config = tls::load_server_config(&config.tls)?;
        let shutdown = shutdown.clone();
        tokio::spawn(async move { tls::serve(listener, server_config, app, shutdown).await })
    } else {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(anyhow::Error::from)
        })
    };

    let server_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            false
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => error!("server task exited unexpectedly"),
                Ok(Err(e)) => error!("server error: {}", e),
                Err(e) => error!("server task panicked: {}", e),
            }
            true
        }
    };

    // Stop accepting, then give in-flight requests a bounded grace window.
    shutdown.cancel();
    if !server_finished
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut server_task)
            .await
            .is_err()
    {
        warn!("grace window elapsed, aborting in-flight requests");
        server_task.abort();
    }

    let _ = health_task.await;
    sweeper_task.abort();
    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    info!("balancerd shutdown complete");
    Ok(())
}
