mod config;
mod dispatch;
mod http;
mod mqtt;
mod registry;
mod uploader;
mod variables;

use crate::config::Config;
use crate::dispatch::{DispatchChannel, DispatchOutcome, HttpDispatcher};
use crate::registry::StationRegistry;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pws_uplink=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let cancel = CancellationToken::new();
    let registry = Arc::new(StationRegistry::new());

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<DispatchOutcome>();
    let channel: Arc<dyn DispatchChannel> = Arc::new(HttpDispatcher::new(
        reqwest::Client::new(),
        config.http_timeout,
        outcome_tx,
    ));
    let uplink = uploader::spawn_uploader(
        &config,
        registry.clone(),
        channel,
        outcome_rx,
        cancel.clone(),
    );

    let mqtt_config = config.clone();
    let mqtt_registry = registry.clone();
    let mqtt_cancel = cancel.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(err) = mqtt::run_mqtt_ingest(mqtt_config, mqtt_registry, mqtt_cancel).await {
            tracing::error!(error=%err, "mqtt ingest exited");
        }
    });

    let app = http::router(http::HttpState { uplink });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind=%config.http_bind, "pws-uplink HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = mqtt_handle => {}
        _ = http_handle => {}
    }

    cancel.cancel();
    Ok(())
}
