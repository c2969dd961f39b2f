//! OIDC gateway
//!
//! Single binary running two listeners:
//! 1. Client listener: browser login with Authorization Code + PKCE, session
//!    cookie, transparent access token refresh, logout
//! 2. Resource listener: `/protected` accepting only bearer JWTs signed by
//!    the provider's current keys, plus `/health` and `/metrics`

mod client;
mod config;
mod error;
mod metrics;
mod resource;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bearer_verifier::{BearerVerifier, HttpKeySource, SigningKeySet, VerifierConfig};
use oidc_auth::TokenClient;
use oidc_session::{RefreshPolicy, SessionStore, StateGuard};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::ClientState;
use crate::config::Config;
use crate::resource::ResourceState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oidc-gateway");

    // Install before the session and verifier crates emit anything
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let endpoints = config.provider.endpoints();
    let settings = config.provider.client_settings();
    info!(
        issuer = %endpoints.issuer,
        client_id = %settings.client_id,
        confidential = settings.client_secret.is_some(),
        client_addr = %config.client.listen_addr,
        resource_addr = %config.resource.listen_addr,
        audience_verified = config.resource.audience.verify,
        "configuration loaded"
    );

    let http = reqwest::Client::new();
    let timeout = config.provider.timeout();

    // --- Client side: sessions, state guard, refresh policy ---
    let tokens = TokenClient::new(http.clone(), &endpoints.token, &settings.client_id)
        .with_client_secret(settings.client_secret.clone())
        .with_timeout(timeout);
    let store = Arc::new(SessionStore::new());
    let guard = StateGuard::new(store.clone())
        .with_ttl(Duration::from_secs(config.client.pending_flow_ttl_secs));
    let refresh = RefreshPolicy::new(store.clone(), tokens.clone())
        .with_leeway(Duration::from_secs(config.client.refresh_leeway_secs));

    let client_state = ClientState {
        endpoints: Arc::new(endpoints.clone()),
        settings: Arc::new(settings),
        store,
        guard: Arc::new(guard),
        refresh: Arc::new(refresh),
        tokens,
    };

    // --- Resource side: JWKS cache and verifier ---
    let key_source = Arc::new(HttpKeySource::new(http, &endpoints.jwks).with_timeout(timeout));
    let keys = Arc::new(
        SigningKeySet::new(key_source)
            .with_min_refresh_interval(Duration::from_secs(config.resource.jwks_min_refresh_secs)),
    );
    match keys.prime().await {
        Ok(count) => info!(keys = count, jwks_uri = %endpoints.jwks, "signing keys loaded"),
        Err(e) => warn!(error = %e, jwks_uri = %endpoints.jwks, "signing keys not loaded yet, fetching on first request"),
    }

    let mut verifier_config =
        VerifierConfig::new(endpoints.issuer.clone(), config.resource.audience_policy());
    verifier_config.allowed_algorithms = config.resource.algorithms()?;
    verifier_config.leeway = Duration::from_secs(config.resource.clock_skew_secs);

    let resource_state = ResourceState {
        verifier: Arc::new(BearerVerifier::new(keys, verifier_config)),
        prometheus: prometheus_handle,
    };

    let client_app = client::build_router(client_state, config.client.secure_cookies);
    let resource_app = resource::build_router(resource_state, config.resource.max_connections);

    let client_listener = TcpListener::bind(config.client.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.client.listen_addr))?;
    let resource_listener = TcpListener::bind(config.resource.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.resource.listen_addr))?;

    info!(
        client_addr = %config.client.listen_addr,
        resource_addr = %config.resource.listen_addr,
        "accepting requests"
    );

    // Both listeners drain on the same signal; DRAIN_TIMEOUT starts when it fires.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let client_server = {
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(client_listener, client_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        })
    };
    let resource_server = {
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            axum::serve(resource_listener, resource_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        })
    };

    // Wait for the OS signal
    shutdown_signal().await;

    // Signal the servers to begin draining
    let _ = shutdown_tx.send(true);

    let drained = async {
        let (client, resource) = tokio::join!(client_server, resource_server);
        [("client", client), ("resource", resource)]
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(results) => {
            for (listener, result) in results {
                match result {
                    Ok(Ok(())) => info!(listener, "all in-flight requests drained"),
                    Ok(Err(e)) => error!(listener, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
