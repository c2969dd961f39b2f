//! Bearer-protected resource listener

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bearer_verifier::BearerVerifier;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::metrics;

/// Shared state for the resource listener.
#[derive(Clone)]
pub struct ResourceState {
    pub verifier: Arc<BearerVerifier>,
    pub prometheus: PrometheusHandle,
}

/// Build the resource router.
///
/// `max_connections` caps concurrently handled requests.
pub fn build_router(state: ResourceState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/protected", get(protected_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(metrics::track_resource))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "status": "ok" }).to_string(),
    )
}

async fn metrics_handler(State(state): State<ResourceState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Echo the verified caller's identity.
#[instrument(skip_all)]
async fn protected_handler(
    State(state): State<ResourceState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let claims = match state.verifier.verify_authorization(authorization).await {
        Ok(claims) => {
            metrics::record_verification("valid");
            claims
        }
        Err(e) => {
            metrics::record_verification(e.label());
            return Err(e.into());
        }
    };

    info!(sub = claims.sub().unwrap_or("-"), "protected resource served");
    Ok(axum::Json(serde_json::json!({
        "message": "You are authenticated!",
        "sub": claims.sub(),
        "preferred_username": claims.preferred_username(),
        "scope": claims.scope(),
        "realm_roles": claims.realm_roles(),
    })))
}
