mod alerts;
mod config;
mod db;
mod errors;
mod metrics;
mod model;
mod mqtt;
mod normalize;
mod pipeline;
mod rest;
mod ws;

use axum::{routing::get, Router};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ws::Broadcaster;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting PLTS telemetry server");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!(
        "Topics: {} / {}",
        config.topic_temperature, config.topic_pzem
    );
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let broadcaster = Arc::new(Broadcaster::new());

    // One bounded channel bridges the MQTT event loop into the single
    // worker that owns all store/evaluate/broadcast calls.
    let (jobs_tx, jobs_rx) = mpsc::channel(config.channel_capacity);

    let worker_pool = pool.clone();
    let worker_broadcaster = broadcaster.clone();
    let worker_handle = tokio::spawn(async move {
        pipeline::run_worker(jobs_rx, worker_pool, worker_broadcaster).await;
    });

    let mqtt_config = config.clone();
    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(mqtt_config, jobs_tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pool.clone(), broadcaster.clone()));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = &mut mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");

    // Stop accepting new messages; dropping the MQTT task drops the job
    // sender, so the worker drains what is in flight and exits.
    mqtt_handle.abort();
    server_handle.abort();
    if tokio::time::timeout(Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        error!("Pipeline worker did not drain in time");
    }

    broadcaster.close_all().await;
    pool.close().await;
    info!("Shutdown complete");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
