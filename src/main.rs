use anyhow::{Context, Result};
use pulse::api::{create_router, AppState};
use pulse::config::Config;
use pulse::credentials::CredentialStore;
use pulse::provider::{AnalyticsClient, OauthClient};
use pulse::session::SessionStore;
use pulse::sync::{SyncEngine, SyncLogStore, SnapshotStore, TriggerType};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=info".into()),
        )
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let credentials = Arc::new(CredentialStore::new(
        config.data_dir.join("credentials.db"),
        config.cipher.clone(),
        config.refresh_skew,
    )?);
    let sessions = Arc::new(SessionStore::new(
        config.data_dir.join("sessions.db"),
        config.session_ttl,
    )?);
    let sync_log = Arc::new(SyncLogStore::new(config.data_dir.join("sync_logs.db"))?);
    let snapshots = Arc::new(SnapshotStore::new(config.data_dir.join("snapshots.db"))?);

    let oauth = Arc::new(OauthClient::new(config.provider.clone()));
    let analytics = Arc::new(AnalyticsClient::new(&config.provider));

    let engine = Arc::new(SyncEngine::new(
        credentials.clone(),
        snapshots,
        sync_log.clone(),
        oauth.clone(),
        analytics,
        config.sync.clone(),
    ));

    // Scheduled sync loop; the first tick fires immediately and is skipped so
    // startup does not trigger a run.
    let scheduled_engine = engine.clone();
    let interval = config.sync_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = scheduled_engine.run(TriggerType::Scheduled).await {
                error!(error = %e, "Scheduled sync run failed");
            }
        }
    });

    let app = create_router(AppState {
        sessions,
        credentials,
        oauth,
        sync_log,
        engine,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Pulse listening");

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
