//! NSX Operator
//!
//! Reconciles networking CRDs against the NSX Policy API:
//! - IPAddressAllocation: carves address blocks from the configured IP pools
//! - Subnet: creates VPC subnets sized or addressed by the CR
//!
//! It also validates IPAddressAllocation, AddressBinding and Subnet changes
//! through an admission webhook, and garbage-collects backend objects whose
//! CR no longer exists.

mod allocator;
mod backoff;
mod config;
mod controller;
mod error;
mod gc;
mod metrics;
mod network_mode;
mod realization;
mod reconciler;
mod resource;
mod services;
mod status;
mod store;
mod watcher;
mod webhook;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting NSX Operator");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  NSX Manager: {}", config.nsx_manager_url);
    info!("  Project: {}", config.nsx_project);
    info!("  Cluster: {}", config.cluster_name);
    info!("  Workers per kind: {}", config.worker_concurrency);
    info!("  GC interval: {:?}", config.gc_interval);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
