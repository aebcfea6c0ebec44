//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Operator binary for Orasi service discovery
//!
//! `DISCOVERY_MODE` selects what to do:
//! - `register`: keep `SERVICE_NAME` at `SERVICE_ADDR` registered until SIGINT/SIGTERM
//! - `resolve`: follow `SERVICE_NAME` and log every target change
//! - `list` (default): print every registered entry as JSON

use service_discovery::{
    net, registry, DiscoveryConfig, DiscoveryError, RegistrationLoop, Resolver,
    ServiceDescriptor, DISCOVERY_VERSION,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting orasi-discovery v{}", DISCOVERY_VERSION);

    let config = load_config()?;
    let mode = std::env::var("DISCOVERY_MODE").unwrap_or_else(|_| "list".to_string());

    match mode.as_str() {
        "register" => register(&config).await?,
        "resolve" => resolve(&config).await?,
        "list" => list(&config).await?,
        other => {
            return Err(Box::new(DiscoveryError::Configuration(format!(
                "unknown DISCOVERY_MODE {}, expected register, resolve or list",
                other
            ))) as Box<dyn std::error::Error>);
        }
    }

    Ok(())
}

/// Load configuration from `DISCOVERY_CONFIG` if set, otherwise from the environment
fn load_config() -> Result<DiscoveryConfig, DiscoveryError> {
    match std::env::var("DISCOVERY_CONFIG") {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            DiscoveryConfig::from_file(path)
        }
        Err(_) => DiscoveryConfig::from_env(),
    }
}

fn required_env(key: &str) -> Result<String, DiscoveryError> {
    std::env::var(key)
        .map_err(|_| DiscoveryError::Configuration(format!("{} must be set", key)))
}

async fn register(config: &DiscoveryConfig) -> Result<(), DiscoveryError> {
    let name = required_env("SERVICE_NAME")?;
    let node = net::advertised_node(&required_env("SERVICE_ADDR")?)?;

    let mut service = ServiceDescriptor::new(name).with_node(node);
    if let Ok(version) = std::env::var("SERVICE_VERSION") {
        service = service.with_version(version);
    }

    info!(
        "Registering {} as node {} at {}",
        service.name,
        service.nodes[0].id,
        service.nodes[0].endpoint()
    );

    let registry = registry::connect(config).await?;
    let handle = RegistrationLoop::from_config(registry, service, config).spawn()?;

    shutdown_signal().await;
    handle.shutdown().await?;

    info!("Registration shutdown completed");
    Ok(())
}

async fn resolve(config: &DiscoveryConfig) -> Result<(), DiscoveryError> {
    let name = required_env("SERVICE_NAME")?;
    let registry = registry::connect(config).await?;

    let mut resolver = Resolver::new(registry, name.clone(), config.reconnect_delay);
    let stop = resolver.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.stop();
    });

    loop {
        match resolver.next().await {
            Ok(updates) => {
                for update in &updates {
                    info!("{}: {:?}", name, update);
                }
                info!(
                    "{} targets: {:?}",
                    name,
                    resolver.targets().into_iter().collect::<Vec<_>>()
                );
            }
            Err(DiscoveryError::Stopped) => break,
            Err(e) => {
                warn!("Failed to resolve {}: {}", name, e);
                tokio::time::sleep(config.reconnect_delay).await;
            }
        }
    }

    info!("Stopped following {}", name);
    Ok(())
}

async fn list(config: &DiscoveryConfig) -> Result<(), DiscoveryError> {
    let registry = registry::connect(config).await?;
    let services = registry.list_services().await?;
    println!("{}", serde_json::to_string_pretty(&services)?);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }
}
