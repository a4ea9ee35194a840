use anyhow::{Context, Result};
use hearth::api::create_router;
use hearth::clock::SystemClock;
use hearth::config::load_or_default;
use hearth::controller::{HttpModeController, ModeController};
use hearth::household::{Collaborators, Household};
use hearth::router::HeartbeatRouter;
use hearth::store::open_store;
use hearth::transport::{pump_inbound, NatsTransport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info".into()),
        )
        .init();

    info!("Hearth starting...");

    let config_path = std::env::var("HEARTH_CONFIG").unwrap_or_else(|_| "hearth.toml".to_string());
    let config = load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!(path = %config_path, "Configuration loaded");

    let store = open_store(&config.store)?;

    let controller: Option<Arc<dyn ModeController>> = match &config.controller.base_url {
        Some(url) => {
            info!(url = %url, "Mode controller enabled");
            Some(Arc::new(HttpModeController::new(
                url.clone(),
                Duration::from_millis(config.controller.timeout_millis),
            )?))
        }
        None => {
            warn!("No mode controller configured, mode pushes disabled");
            None
        }
    };

    let router = HeartbeatRouter::new(config.nats.subject_prefix.clone());
    let (transport, inbound_rx) = NatsTransport::connect(&config.nats, router.clone()).await?;

    let household = Household::new(
        config.presence.clone(),
        config.household.policy,
        router,
        Collaborators {
            store,
            clock: Arc::new(SystemClock),
            subscriptions: transport,
            controller,
        },
    );

    household.restore()?;

    for entity in &config.entities {
        if let Err(e) = household.add_entity(&entity.identity, &entity.label, entity.timeout_seconds) {
            error!(identity = %entity.identity, error = %e, "Skipping configured entity");
        }
    }

    let _loops = household.start();
    tokio::spawn(pump_inbound(inbound_rx, Arc::clone(&household)));

    let app = create_router(Arc::clone(&household));
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind))?;
    info!("HTTP API listening on {}", config.api.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Hearth stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
