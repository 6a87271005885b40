use anyhow::Result;
use std::sync::Arc;
use tokio::signal;

use lib_statsync::configs::defaults_catalog::DefaultsCatalog;
use lib_statsync::sources::{PostgrestSnapshot, RealtimeConfig, RealtimeFeed};
use lib_statsync::{LifecycleOptions, MetricStore, SubscriptionLifecycle};

mod stats_logic;
use stats_logic::{api, config, logger, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?;
    let log_path = logger::setup_logging(&settings.log_dir, &settings.log_level, "server_stats")?;
    log::info!("Logging to {}", log_path.display());

    let catalog = match &settings.defaults_path {
        Some(path) => DefaultsCatalog::load(path)?,
        None => DefaultsCatalog::builtin(),
    };
    log::debug!("{}", catalog);

    let store = Arc::new(MetricStore::new());
    let source = PostgrestSnapshot::new(&settings.backend_url, &settings.anon_key, &settings.table, settings.columns.clone())?;
    let feed = RealtimeFeed::new(RealtimeConfig {
        base_url: settings.backend_url.clone(),
        api_key: settings.anon_key.clone(),
        schema: settings.schema.clone(),
        table: settings.table.clone(),
        columns: settings.columns.clone(),
        ..RealtimeConfig::default()
    });
    let lifecycle = Arc::new(SubscriptionLifecycle::new(
        Arc::clone(&store),
        Arc::new(source),
        Arc::new(feed),
        LifecycleOptions {
            policy: settings.resync_policy,
            refetch_on_resync: settings.refetch_on_resync,
        },
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // Until the first attach succeeds the API serves defaults.
    let upstream_handle = tokio::spawn(upstream::run(
        Arc::clone(&lifecycle),
        settings.topic.clone(),
        settings.reconnect_delay,
        shutdown_tx.subscribe(),
    ));

    let state = Arc::new(api::ApiState {
        resolver: lifecycle.resolver(),
        catalog,
    });
    let api_handle = tokio::spawn(api::run(settings.port, state, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("SIGTERM handler unavailable: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());
    match api_handle.await {
        Ok(Err(e)) => log::error!("Stats API failed: {}", e),
        Err(e) => log::error!("Stats API task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = upstream_handle.await {
        log::error!("Upstream task panicked: {}", e);
    }

    lifecycle.detach_all();
    log::info!("Shutdown complete.");
    Ok(())
}
