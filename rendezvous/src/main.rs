use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use rendezvous_cluster::{ChangeEvent, DiscoveryEngine, DiscoveryOptions, Registration};
use rendezvous_core::{config::load_config, logging, ServiceConfig};

/// Registration for this process, if the config names a service
fn registration(service: &ServiceConfig) -> Option<Registration> {
    let name = service.name.as_ref()?;
    let mut registration = Registration::new(name.clone())
        .ping_interval(Duration::from_millis(service.ping_interval_ms));
    if let Some(endpoint) = &service.endpoint {
        registration = registration.endpoint(endpoint.clone());
    }
    if let Some(balancer) = &service.balancer {
        registration = registration.balancer(balancer.clone());
    }
    Some(registration)
}

fn log_change(event: &ChangeEvent) -> anyhow::Result<()> {
    for record in &event.added {
        info!(
            store = %event.store_kind,
            service = %record.service_name,
            endpoint = %record.endpoint,
            balancer = record.balancer.as_deref().unwrap_or("none"),
            "Peer available"
        );
    }
    for record in &event.removed {
        info!(
            store = %event.store_kind,
            service = %record.service_name,
            endpoint = %record.endpoint,
            "Peer gone"
        );
    }
    info!(store = %event.store_kind, live = event.all.len(), "Discovery view updated");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Rendezvous starting...");

    // 3. Build the engine; callbacks go in before connect so the first view is logged
    let engine = DiscoveryEngine::new(DiscoveryOptions::from(&config.discovery));
    engine.add_change_callback(Arc::new(log_change));

    // 4. Connect to the discovery backend
    engine.connect(&config.discovery.url).await.map_err(|e| {
        error!("Failed to connect to discovery backend: {}", e);
        anyhow::anyhow!("Discovery connect failed: {e}")
    })?;

    // 5. Publish this instance, if configured
    if let Some(registration) = registration(&config.service) {
        if let Err(e) = engine.register(registration).await {
            error!("Failed to register with discovery backend: {}", e);
            engine.disconnect().await.ok();
            return Err(e.into());
        }
    } else {
        info!("No service configured, running as an observer");
    }

    // 6. Run until asked to stop
    shutdown_signal().await;
    info!("Shutdown signal received, leaving the cluster...");

    engine.disconnect().await?;
    info!("Rendezvous stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
