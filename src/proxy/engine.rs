use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, request::Parts, HeaderName},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::admin;
use crate::backend::{Backend, BackendRegistry};
use crate::error::{BalancerError, Result};
use crate::observability::MetricsCollector;

use super::{CircuitBreaker, LoadBalancer, RateLimiter};

/// Total forward attempts per request, across distinct backends.
const MAX_ATTEMPTS: usize = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The request-dispatch engine. Owns the registry (through the policy), the
/// circuit breaker, the rate limiter and the metrics sink; handlers receive
/// it by injection rather than through process-wide state.
pub struct Balancer {
    policy: LoadBalancer,
    breaker: CircuitBreaker,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    client: reqwest::Client,
    request_deadline: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<Balancer>,
}

impl Balancer {
    pub fn new(
        policy: LoadBalancer,
        breaker: CircuitBreaker,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        request_deadline: Duration,
    ) -> AnyResult<Self> {
        // Redirects must pass through to the client verbatim.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request_deadline)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent(concat!("balancerd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            policy,
            breaker,
            limiter,
            metrics,
            client,
            request_deadline,
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.policy.registry()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Forward one client request: select under the breaker, account
    /// in-flight, proxy, measure, and feed outcomes back. The request body is
    /// buffered once so retries re-send the same payload; the response body
    /// streams straight through.
    #[instrument(skip(self, request), fields(request_id, method, uri, client_ip))]
    pub async fn dispatch(&self, request: Request, client: SocketAddr) -> Result<Response> {
        let request_id = Uuid::new_v4().to_string();
        let method = request.method().to_string();
        let uri = request.uri().to_string();

        tracing::Span::current()
            .record("request_id", request_id.as_str())
            .record("method", method.as_str())
            .record("uri", uri.as_str())
            .record("client_ip", client.ip().to_string().as_str());

        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| BalancerError::BadRequest(format!("failed to read request body: {}", e)))?
            .to_bytes();

        match tokio::time::timeout(
            self.request_deadline,
            self.try_backends(&parts, body, client.ip(), &request_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("request deadline elapsed before a backend responded");
                Err(BalancerError::BackendTimeout)
            }
        }
    }

    /// The attempt loop. A transport failure moves on to a different backend;
    /// selection handing back an already-tried backend means there is nothing
    /// distinct left to retry on.
    async fn try_backends(
        &self,
        parts: &Parts,
        body: Bytes,
        client_ip: IpAddr,
        request_id: &str,
    ) -> Result<Response> {
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<BalancerError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            // A failure earlier in this request may have tripped the breaker;
            // the transport error stays the authoritative outcome.
            if let Err(e) = self.breaker.try_acquire() {
                return Err(last_error.unwrap_or(e));
            }

            let backend = match self.policy.next().await {
                Ok(backend) => backend,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            if tried.iter().any(|url| url == backend.url().as_str()) {
                break;
            }
            tried.push(backend.url().to_string());

            match self
                .forward_once(&backend, parts, body.clone(), client_ip, request_id)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        attempt,
                        backend = %backend.url(),
                        error = %e,
                        "forward attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(BalancerError::NoServersAvailable))
    }

    async fn forward_once(
        &self,
        backend: &Arc<Backend>,
        parts: &Parts,
        body: Bytes,
        client_ip: IpAddr,
        request_id: &str,
    ) -> Result<Response> {
        let guard = InFlightGuard::new(backend.clone(), self.metrics.clone());
        let started = Instant::now();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target_url = format!(
            "{}{}",
            backend.url().as_str().trim_end_matches('/'),
            path_and_query
        );

        debug!(target = %target_url, "forwarding request");

        let mut builder = self.client.request(parts.method.clone(), target_url.as_str());

        // Hop-by-hop headers stay on this hop; the client sets Host and
        // Content-Length for the backend leg.
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name)
                && name != header::HOST
                && name != header::CONTENT_LENGTH
            {
                builder = builder.header(name.clone(), value.clone());
            }
        }

        let proto = if parts.uri.scheme_str() == Some("https") {
            "https"
        } else {
            "http"
        };
        builder = builder
            .header("x-forwarded-for", client_ip.to_string())
            .header("x-real-ip", client_ip.to_string())
            .header("x-forwarded-proto", proto)
            .header("x-request-id", request_id);

        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                backend.record_forward_failure();
                // A refused or unreachable backend is demoted immediately; a
                // reachable backend that errors mid-exchange is left to the
                // health checker.
                if e.is_connect() || e.is_timeout() {
                    backend.set_active(false);
                }
                self.breaker.record_failure();
                return Err(BalancerError::BackendTransport(e.to_string()));
            }
        };

        // Response headers are in: this attempt counts as a success whatever
        // the status code says.
        let elapsed = started.elapsed();
        backend.record_response_time(elapsed);
        backend.record_forward_success();
        self.breaker.record_success();

        debug!(
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "backend responded"
        );

        let status = response.status();
        let headers = response.headers().clone();

        // The guard rides the body stream so the in-flight slot is held until
        // streaming completes or the client goes away.
        let stream = response.bytes_stream().inspect(move |_| {
            let _ = &guard;
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in headers.iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name.clone(), value.clone());
            }
        }

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| BalancerError::Internal(format!("failed to build response: {}", e)))
    }
}

/// Build the listener router: admin routes short-circuit before backend
/// selection, everything else falls through to the forwarder. Rate limiting
/// wraps both so admission happens first.
pub fn router(balancer: Arc<Balancer>) -> Router {
    let state = AppState { balancer };

    Router::new()
        .route("/health", get(admin::liveness))
        .route(
            "/servers",
            get(admin::list_backends)
                .post(admin::add_backend)
                .delete(admin::remove_backend),
        )
        .fallback(forward)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn forward(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match state.balancer.dispatch(request, addr).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.balancer.limiter.allow(addr.ip()) {
        return BalancerError::RateLimited.into_response();
    }
    next.run(request).await
}

async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .balancer
        .metrics
        .record_request(response.status().as_u16(), started.elapsed());
    response
}

/// Pairs the in-flight increment with exactly one decrement on every exit
/// path, including cancellation and panic.
struct InFlightGuard {
    backend: Arc<Backend>,
    metrics: Arc<MetricsCollector>,
}

impl InFlightGuard {
    fn new(backend: Arc<Backend>, metrics: Arc<MetricsCollector>) -> Self {
        backend.begin_request();
        metrics.connection_opened(backend.url().as_str());
        Self { backend, metrics }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.end_request();
        self.metrics.connection_closed(self.backend.url().as_str());
    }
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
