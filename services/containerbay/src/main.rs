//! containerbay
//!
//! Serves static websites stored inside OCI images. Images are pulled on
//! first request, extracted into a local cache and served from disk after
//! that.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use containerbay::{
    admission::Admission,
    api,
    cleanup::CleanupWorker,
    config::Cli,
    image::{ImageSource, OciConfig, OciImageSource},
    resolve::{HickoryTxtLookup, Resolver},
    scheduler::FetchScheduler,
    state::AppState,
    store::CacheStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;

    // Initialize tracing (prefer RUST_LOG, fallback to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting containerbay");
    info!(
        listen_addr = %config.listen_addr,
        store = %config.store.display(),
        max_size = config.max_size,
        default_image = %config.resolver.default_image,
        standalone_image = ?config.resolver.standalone_image,
        magic_dns = ?config.resolver.magic_dns,
        gzip = config.gzip,
        "Configuration loaded"
    );

    let store = Arc::new(CacheStore::new(&config.store));
    if let Err(e) = store.ensure_exists() {
        error!(error = %e, "Failed to create cache store");
        return Err(e.into());
    }
    if let Err(e) = store.clean_all() {
        warn!(error = %e, "Failed to empty cache store");
    }

    let source: Arc<dyn ImageSource> = Arc::new(
        OciImageSource::new(OciConfig {
            credentials: config.credentials.clone(),
            ..OciConfig::default()
        })
        .context("Failed to create registry client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup_worker = CleanupWorker::new(store.clone(), config.cleanup.clone());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    let scheduler = FetchScheduler::start(config.scheduler.clone(), store, source.clone());
    let resolver = Resolver::new(config.resolver.clone(), Arc::new(HickoryTxtLookup::new()));
    let admission = Admission::new(source, config.max_size);

    let state = AppState::new(resolver, admission, scheduler);
    let app = api::create_router(state, config.gzip);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "Failed to bind");
            return Err(e.into());
        }
    };
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    let server_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            true
        }
    };

    // Signal shutdown to the server and the cleanup worker. Fetch workers
    // are left to die with the runtime.
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);
    if !server_done && tokio::time::timeout(shutdown_timeout, server_handle).await.is_err() {
        warn!("HTTP server did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, cleanup_handle).await.is_err() {
        warn!("Cleanup worker did not shut down in time");
    }

    info!("containerbay shutdown complete");
    Ok(())
}
