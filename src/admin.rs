use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::backend::{Backend, BackendStatus};
use crate::error::{BalancerError, Result};
use crate::proxy::AppState;

#[derive(Debug, Deserialize)]
pub struct BackendRequest {
    pub url: String,
}

/// Liveness of the balancer itself.
pub async fn liveness() -> &'static str {
    "OK"
}

pub async fn list_backends(State(state): State<AppState>) -> Json<Vec<BackendStatus>> {
    let snapshot = state.balancer.registry().snapshot().await;
    Json(snapshot.iter().map(|backend| backend.status()).collect())
}

/// Register a new backend. It starts active; the next health tick confirms
/// or demotes it.
pub async fn add_backend(
    State(state): State<AppState>,
    Json(request): Json<BackendRequest>,
) -> Result<impl IntoResponse> {
    let backend = Arc::new(Backend::new(&request.url)?);
    state.balancer.registry().add(backend.clone()).await?;

    info!(url = %backend.url(), "backend added via admin");
    Ok((StatusCode::CREATED, Json(backend.status())))
}

pub async fn remove_backend(
    State(state): State<AppState>,
    Json(request): Json<BackendRequest>,
) -> Result<impl IntoResponse> {
    let url = Url::parse(&request.url)
        .map_err(|e| BalancerError::BadRequest(format!("invalid URL '{}': {}", request.url, e)))?;
    state.balancer.registry().remove(url.as_str()).await?;

    info!(url = %url, "backend removed via admin");
    Ok(StatusCode::OK)
}
