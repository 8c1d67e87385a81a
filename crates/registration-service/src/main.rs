//! Tenant Registration Service - Entry point.

use registration_service::{
    api::{create_router_with_rate_limit, AppState, RateLimitState},
    config::Config,
    CredentialIssuer, InMemoryTenantDirectory, RegistrationOrchestrator,
};
use registration_store::{spawn_sweeper, InMemorySessionStore, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Tenant Registration Service");

    // OAuth adapters for every configured platform
    let providers = match config.provider_registry() {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to configure OAuth providers: {:#}", e);
            std::process::exit(1);
        }
    };
    if providers.platforms().is_empty() {
        warn!("No integrations enabled; every registration will be rejected");
    }

    // Session store and sweeper
    let store = Arc::new(InMemorySessionStore::new(config.session.ttl));
    let sweeper = spawn_sweeper(
        store.clone() as Arc<dyn SessionStore>,
        config.session.sweep_interval,
    );
    info!(
        ttl = ?config.session.ttl,
        sweep_interval = ?config.session.sweep_interval,
        "Session store ready"
    );

    // Login credentials
    let credentials = match &config.credentials.signing_secret {
        Some(secret) => CredentialIssuer::new(
            secret.clone(),
            config.credentials.access_ttl,
            config.credentials.refresh_ttl,
        ),
        None => {
            warn!("CREDENTIALS__SIGNING_SECRET not set, using an ephemeral signing key");
            CredentialIssuer::ephemeral(
                config.credentials.access_ttl,
                config.credentials.refresh_ttl,
            )
        }
    };

    // Tenant directory backs both the availability check and provisioning
    let directory = Arc::new(InMemoryTenantDirectory::new());

    let orchestrator = RegistrationOrchestrator::new(
        store,
        providers,
        directory.clone(),
        directory,
        credentials,
    )
    .with_default_plan(&config.provisioning.default_plan);

    // Create application state and router
    let state = AppState::new(orchestrator);
    let rate_limit = RateLimitState::new(
        config.rate_limit.global_per_minute,
        config.rate_limit.start_per_minute,
    );
    let app = create_router_with_rate_limit(state, rate_limit);

    // Bind to address
    let addr = SocketAddr::new(
        config
            .server
            .listen_addr
            .parse()
            .unwrap_or([0, 0, 0, 0].into()),
        config.server.port,
    );

    info!("Listening on {}", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Run server
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
