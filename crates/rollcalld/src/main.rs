use anyhow::Result;
use rollcall_core::PairwiseVerifier;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod dbus_interface;
mod ledger;

use controller::{CameraController, CameraSessionLauncher};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;

    // Fingerprint verification is optional: without an artifact every
    // query fails with "model is not loaded" until the daemon is restarted.
    let verifier = match PairwiseVerifier::from_artifact(config.fingerprint.clone(), &config.artifact_path) {
        Ok(verifier) => {
            tracing::info!(artifact = %config.artifact_path.display(), "fingerprint model loaded");
            verifier
        }
        Err(e) => {
            tracing::warn!(error = %e, "fingerprint verification unavailable");
            PairwiseVerifier::new(config.fingerprint.clone())
        }
    };

    let controller = Arc::new(CameraController::new(Arc::new(CameraSessionLauncher::new(
        config.clone(),
    ))));
    let service = RollcallService::new(
        Arc::clone(&controller),
        Arc::new(verifier),
        config.artifact_path.clone(),
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        bus = BUS_NAME,
        system_bus = config.system_bus,
        camera = %config.camera_device,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if tokio::task::spawn_blocking(move || controller.stop()).await? {
        tracing::info!("camera session stopped on shutdown");
    }

    Ok(())
}
