mod cache;
mod config;
mod db;
mod mqtt;
mod orchestrator;
mod report;
mod session;
mod weather;
mod web;

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cache::WeatherCache;
use db::Store;
use mqtt::{decode_inbound, subscribe_inbound, DeviceLink, MqttLink};
use orchestrator::Orchestrator;
use report::ReportClient;
use weather::ForecastClient;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Storage ─────────────────────────────────────────────────────
    let store = Store::connect(&cfg.database.url).await?;
    store.migrate().await?;
    let cache = WeatherCache::new(store.pool().clone());
    info!(url = %cfg.database.url, "store ready");

    // ── External clients ────────────────────────────────────────────
    let forecast = ForecastClient::new(&cfg.weather.base_url, &cfg.weather.api_key)?;
    let reporter = ReportClient::new(
        &cfg.reporting.base_url,
        &cfg.reporting.api_key,
        &cfg.reporting.model,
    )?;

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        cfg.mqtt.client_id.clone(),
        cfg.mqtt.host.clone(),
        cfg.mqtt.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&cfg.mqtt.username, &cfg.mqtt.password) {
        mqttoptions.set_credentials(user.clone(), pass.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let connected = Arc::new(AtomicBool::new(false));
    let link: Arc<dyn DeviceLink> = Arc::new(MqttLink::new(client.clone(), connected.clone()));

    // ── Orchestrator ────────────────────────────────────────────────
    let orch = Arc::new(Orchestrator::new(
        cfg.clone(),
        store,
        cache,
        link,
        forecast,
        reporter,
    ));
    orch.purge_retention().await;

    // ── Shutdown signal ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            return;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    // ── Web server ──────────────────────────────────────────────────
    let web_orch = Arc::clone(&orch);
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        web::serve(web_orch, web_port).await;
    });

    // ── Background loops ────────────────────────────────────────────
    tokio::spawn(Arc::clone(&orch).weather_loop(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&orch).heartbeat_loop(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&orch).time_sync_loop(shutdown_rx.clone()));

    // ── MQTT receive loop ───────────────────────────────────────────
    let device_id = cfg.device.id.clone();
    let mut shutdown = shutdown_rx;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping mqtt receive loop");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if let Some(ev) = decode_inbound(&p.topic, &p.payload) {
                        orch.dispatch(ev).await;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected.store(true, Ordering::Relaxed);
                    // Re-subscribe on every (re)connect.
                    subscribe_inbound(&client, &device_id).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    connected.store(false, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::Relaxed);
                    error!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    Ok(())
}
