//! hypemand: the hypeman daemon.
//!
//! Boot order matters: host networking is converged before anything can
//! allocate, reconciliation decides which guests may still be alive
//! before orphan cleanup runs, and only then does the embedded registry
//! start accepting pushes.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypeman_manager::clock::SystemClock;
use hypeman_manager::image::convert::Ext4Converter;
use hypeman_manager::image::pull::{PullClient, PullConfig};
use hypeman_manager::image::GuestImageReferences;
use hypeman_manager::oci::BlobStore;
use hypeman_manager::resources::Accounting;
use hypeman_manager::{Config, ImageManager, InstanceManager, NetworkManager, Paths, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting hypeman");

    let config = Config::from_env()?;
    let paths = Paths::new(config.data_dir.clone());
    info!(data_dir = %paths.data_dir().display(), "configuration loaded");

    for dir in [
        paths.system_dir(),
        paths.images_dir(),
        paths.guests_dir(),
        paths.volumes_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let store = Arc::new(BlobStore::open(
        paths.blob_dir(),
        paths.oci_index(),
        paths.oci_layout(),
    )?);
    let pull = Arc::new(PullClient::new(PullConfig::default())?);
    let converter = Arc::new(Ext4Converter::new(
        config.build.clone(),
        Arc::clone(&pull),
        Arc::clone(&store),
    ));
    let clock = Arc::new(SystemClock);

    let images = ImageManager::new(
        paths.clone(),
        config.build.clone(),
        Arc::clone(&store),
        pull,
        converter,
        Arc::new(GuestImageReferences::new(paths.clone())),
        clock.clone(),
    );

    let network = Arc::new(NetworkManager::new(
        config.bridge.clone(),
        config.subnet,
        config.uplink.clone(),
        config.isolate_guests,
        config.bandwidth.clone(),
        StdRng::from_os_rng(),
    ));
    network.initialize().map_err(|e| {
        anyhow::anyhow!("host network initialization failed: {e}")
    })?;

    let accounting = Arc::new(Accounting::new(config.limits.clone()));
    let instances = InstanceManager::new(
        paths.clone(),
        config.clone(),
        Arc::clone(&images),
        Arc::clone(&network),
        accounting,
        clock,
        StdRng::from_os_rng(),
    );

    // Decide liveness before touching devices: ids that may still have a
    // running hypervisor keep their TAPs and shaping classes.
    let preserve = instances.reconcile();
    info!(preserved = preserve.len(), "startup reconciliation complete");
    if let Err(e) = network.cleanup_orphans(Some(&preserve)) {
        warn!(error = %e, "orphan cleanup failed");
    }
    if let Err(e) = images.recover() {
        warn!(error = %e, "image build recovery failed");
    }

    let registry = Registry::new(Arc::clone(&store), Arc::clone(&images), config.upload_session_ttl);
    let gc = registry.spawn_session_gc();

    let listener = tokio::net::TcpListener::bind(config.registry_listen)
        .await
        .with_context(|| format!("binding registry on {}", config.registry_listen))?;
    info!(listen = %config.registry_listen, "embedded registry listening");

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("registry server failed")?;
    info!("shutdown signal received");

    gc.abort();
    images.stop();
    info!("hypeman stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler failed, relying on ctrl-c");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
