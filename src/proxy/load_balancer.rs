use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, BackendRegistry};
use crate::config::Algorithm as ConfigAlgorithm;
use crate::error::{BalancerError, Result};

/// Selection policy over the shared backend registry.
#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<BackendRegistry>,
    algorithm: Algorithm,
}

#[derive(Debug)]
enum Algorithm {
    RoundRobin { current: AtomicUsize },
    LeastConnections,
    WeightedResponseTime,
}

impl LoadBalancer {
    pub fn new(algorithm: ConfigAlgorithm, registry: Arc<BackendRegistry>) -> Self {
        let algorithm = match algorithm {
            ConfigAlgorithm::RoundRobin => Algorithm::RoundRobin {
                current: AtomicUsize::new(0),
            },
            ConfigAlgorithm::LeastConnections => Algorithm::LeastConnections,
            ConfigAlgorithm::WeightedResponseTime => Algorithm::WeightedResponseTime,
        };

        Self {
            registry,
            algorithm,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Select the next backend, skipping inactive entries. Fails with
    /// `NoServersAvailable` when the pool is empty or fully inactive.
    pub async fn next(&self) -> Result<Arc<Backend>> {
        let snapshot = self.registry.snapshot().await;

        if snapshot.is_empty() {
            return Err(BalancerError::NoServersAvailable);
        }

        match &self.algorithm {
            Algorithm::RoundRobin { current } => {
                // The counter is read once per call; the scan from `start`
                // terminates after at most N positions.
                let start = current.fetch_add(1, Ordering::Relaxed) % snapshot.len();
                for offset in 0..snapshot.len() {
                    let backend = &snapshot[(start + offset) % snapshot.len()];
                    if backend.is_active() {
                        debug!(url = %backend.url(), "round-robin selected backend");
                        return Ok(backend.clone());
                    }
                }
                Err(BalancerError::NoServersAvailable)
            }

            Algorithm::LeastConnections => {
                let backend = min_active_by(&snapshot, |b| b.in_flight())
                    .ok_or(BalancerError::NoServersAvailable)?;
                debug!(
                    url = %backend.url(),
                    in_flight = backend.in_flight(),
                    "least-connections selected backend"
                );
                Ok(backend)
            }

            Algorithm::WeightedResponseTime => {
                let backend = min_active_by(&snapshot, |b| b.last_response_time())
                    .ok_or(BalancerError::NoServersAvailable)?;
                debug!(
                    url = %backend.url(),
                    response_time_us = backend.last_response_time().as_micros() as u64,
                    "weighted-response-time selected backend"
                );
                Ok(backend)
            }
        }
    }

    pub fn algorithm_name(&self) -> &'static str {
        match &self.algorithm {
            Algorithm::RoundRobin { .. } => "round-robin",
            Algorithm::LeastConnections => "least-connections",
            Algorithm::WeightedResponseTime => "weighted-response-time",
        }
    }
}

/// First active backend with the minimal key; ties keep the lowest snapshot
/// index. The key is read once per element.
fn min_active_by<K: Ord>(
    snapshot: &[Arc<Backend>],
    key: impl Fn(&Backend) -> K,
) -> Option<Arc<Backend>> {
    let mut best: Option<(K, &Arc<Backend>)> = None;
    for backend in snapshot.iter().filter(|b| b.is_active()) {
        let k = key(backend);
        match &best {
            Some((best_key, _)) if k >= *best_key => {}
            _ => best = Some((k, backend)),
        }
    }
    best.map(|(_, backend)| backend.clone())
}
