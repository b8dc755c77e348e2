use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use url::Url;

use crate::error::{BalancerError, Result};

const DEFAULT_HEALTH_PATH: &str = "/health";
const DEFAULT_WEIGHT: u32 = 1;

/// One backend origin server. Hot fields are atomics so the forward path and
/// the health checker never contend on a lock.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    weight: u32,
    health_path: String,
    active: AtomicBool,
    in_flight: AtomicUsize,
    // microseconds; 0 = no measurement yet
    last_response_time_us: AtomicU64,
    // epoch milliseconds; 0 = never probed
    last_checked_ms: AtomicU64,
    consecutive_failures: AtomicU32,
}

/// Serialized view of a backend, returned by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub active: bool,
    pub in_flight: usize,
    pub last_response_time_ms: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub weight: u32,
}

impl Backend {
    /// New backends start active; the next health tick confirms or demotes.
    pub fn new(url_str: &str) -> Result<Self> {
        let url = Url::parse(url_str)
            .map_err(|e| BalancerError::BadRequest(format!("invalid URL '{}': {}", url_str, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(BalancerError::BadRequest(format!(
                "URL must be http or https: {}",
                url_str
            )));
        }

        if url.host_str().is_none() {
            return Err(BalancerError::BadRequest(format!(
                "URL has no host: {}",
                url_str
            )));
        }

        Ok(Self {
            url,
            weight: DEFAULT_WEIGHT,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            last_response_time_us: AtomicU64::new(0),
            last_checked_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Absolute URL probed by the health checker.
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.url.as_str().trim_end_matches('/'),
            self.health_path
        )
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn last_response_time(&self) -> Duration {
        Duration::from_micros(self.last_response_time_us.load(Ordering::Acquire))
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        self.last_response_time_us
            .store(elapsed.as_micros() as u64, Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// A completed forward resets the failure streak.
    pub fn record_forward_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn record_forward_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
    }

    /// Probe write-back on success: liveness, latency, streak, timestamp.
    pub fn record_probe_success(&self, elapsed: Duration) {
        self.record_response_time(elapsed);
        self.consecutive_failures.store(0, Ordering::Release);
        self.active.store(true, Ordering::Release);
        self.touch_last_checked();
    }

    pub fn record_probe_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.active.store(false, Ordering::Release);
        self.touch_last_checked();
    }

    fn touch_last_checked(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_checked_ms.store(now_ms, Ordering::Release);
    }

    pub fn status(&self) -> BackendStatus {
        let checked_ms = self.last_checked_ms.load(Ordering::Acquire);
        BackendStatus {
            url: self.url.to_string(),
            active: self.is_active(),
            in_flight: self.in_flight(),
            last_response_time_ms: self.last_response_time().as_millis() as u64,
            last_checked: (checked_ms > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(checked_ms as i64))
                .flatten(),
            weight: self.weight,
        }
    }
}

/// Shared, insertion-ordered collection of backends with URL-keyed
/// uniqueness. Readers take cheap snapshots; writers serialize and never hold
/// the lock across I/O.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
        }
    }

    pub async fn add(&self, backend: Arc<Backend>) -> Result<()> {
        let mut backends = self.backends.write().await;

        if backends.iter().any(|b| b.url() == backend.url()) {
            return Err(BalancerError::DuplicateBackend(backend.url().to_string()));
        }

        info!(url = %backend.url(), "registered backend");
        backends.push(backend);
        Ok(())
    }

    pub async fn remove(&self, url: &str) -> Result<()> {
        let mut backends = self.backends.write().await;

        let position = backends
            .iter()
            .position(|b| b.url().as_str() == url)
            .ok_or_else(|| BalancerError::BackendNotFound(url.to_string()))?;

        backends.remove(position);
        info!(url, "removed backend");
        Ok(())
    }

    /// Point-in-time copy of the membership. Never observes a partial
    /// insert or remove; iteration order is insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.read().await.clone()
    }

    /// Replace the entry matching by URL. Internal atomic fields are mutated
    /// directly on the shared record; this is for external replacement only.
    pub async fn update(&self, backend: Arc<Backend>) -> Result<()> {
        let mut backends = self.backends.write().await;

        let slot = backends
            .iter_mut()
            .find(|b| b.url() == backend.url())
            .ok_or_else(|| BalancerError::BackendNotFound(backend.url().to_string()))?;

        *slot = backend;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.backends.read().await.is_empty()
    }
}
