use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use bookd::adapters::google::GoogleWorkspace;
use bookd::adapters::Collaborators;
use bookd::config::Config;
use bookd::engine::Engine;
use bookd::http::{self, ApiState};
use bookd::settings::{InMemoryStore, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    bookd::observability::init(config.metrics_port)?;

    let settings = Settings::from_file(&config.settings_path)?;
    let store = Arc::new(InMemoryStore::from_settings(settings));

    // Hosts without an account get NotConfigured from every Google call, which
    // the engine treats as "no busy time" and "calendar not synced".
    let google = Arc::new(GoogleWorkspace::new(
        config.google_api_base.clone(),
        config.provider_timeout,
    )?);
    let collaborators = Collaborators {
        store: store.clone(),
        busy: google.clone(),
        calendar: google.clone(),
        notifier: google,
    };

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("bookings.wal");
    let engine = Arc::new(Engine::new(wal_path, collaborators, config.engine_options())?);

    tokio::spawn(bookd::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("bookd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  settings: {} ({} hosts, {} links)", config.settings_path.display(), store.host_count(), store.link_count());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    http::serve(listener, Arc::new(ApiState::new(engine)), shutdown_signal()).await?;

    info!("bookd stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable ({e}), waiting for ctrl-c only");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received, draining requests");
}
