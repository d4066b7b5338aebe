//! Simulated greenhouse controller: publishes random-walk telemetry and
//! answers the settings and time-sync exchanges the way the firmware does.
//! Development stand-in for the real device.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct Telemetry {
    temperature: f64,
    humidity: f64,
    free_memory: i64,
    uptime: i64,
    bluetooth_is_active: bool,
}

/// Bounded random walk: drift by at most ±step, clamped to [min, max].
fn walk(current: f64, step: f64, min: f64, max: f64) -> f64 {
    let delta = (fastrand::f64() * 2.0 - 1.0) * step;
    (current + delta).clamp(min, max)
}

/// The firmware's default configuration, as it answers `config/get`.
fn default_settings() -> serde_json::Value {
    serde_json::json!({
        "displayMode": 1,
        "dayOnHour": 8, "dayOnMinute": 0, "dayOffHour": 22, "dayOffMinute": 0,
        "nightOnHour": 22, "nightOnMinute": 0, "nightOffHour": 8, "nightOffMinute": 0,
        "toiletOnHour": 8, "toiletOnMinute": 0, "toiletOffHour": 20, "toiletOffMinute": 0,
        "relayMode": false,
        "manualDayState": false, "manualNightState": false,
        "displayTimeout": 30, "displayChangeModeTimeout": 30,
        "fanDelay": 60, "fanDuration": 5,
        "offlineModeActive": false,
        "showForecastScreen": false,
        "showTempScreen": false
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "greenhouse_01".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    let client_id = format!("greenhouse-sim-{device_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Telemetry publisher
    let tele_client = client.clone();
    let tele_topic = format!("{device_id}/telemetry");
    tokio::spawn(async move {
        let mut temperature = 22.0;
        let mut humidity = 50.0;
        let mut uptime: i64 = 0;

        loop {
            temperature = walk(temperature, 0.4, 10.0, 35.0);
            humidity = walk(humidity, 1.5, 20.0, 90.0);
            uptime += sample_every_s as i64;

            let msg = Telemetry {
                temperature,
                humidity,
                free_memory: 18_000 + fastrand::i64(0..8_000),
                uptime,
                bluetooth_is_active: false,
            };
            let payload = serde_json::to_vec(&msg).expect("telemetry serializes");

            match tele_client
                .publish(&tele_topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(()) => info!(
                    temp = format!("{temperature:.1}"),
                    hum = format!("{humidity:.1}"),
                    "telemetry published"
                ),
                Err(e) => error!("telemetry publish failed: {e}"),
            }

            sleep(Duration::from_secs(sample_every_s)).await;
        }
    });

    let mut settings = default_settings();

    let weather_topic = format!("{device_id}/weather");
    let config_get_topic = format!("{device_id}/config/get");
    let config_set_topic = format!("{device_id}/config/set");
    let time_set_topic = format!("{device_id}/time/set");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to mqtt");
                for topic in [
                    &weather_topic,
                    &config_get_topic,
                    &config_set_topic,
                    &time_set_topic,
                ] {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!(%topic, "subscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic == config_get_topic {
                    // Answer the settings pull with the current config.
                    let payload = settings.to_string();
                    let topic = format!("{device_id}/config/update");
                    if let Err(e) = client
                        .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
                        .await
                    {
                        error!("config/update publish failed: {e}");
                    } else {
                        info!("answered settings request");
                    }
                } else if p.topic == config_set_topic {
                    match serde_json::from_slice::<serde_json::Value>(&p.payload) {
                        Ok(v) => {
                            settings = v;
                            info!("settings updated by backend");
                        }
                        Err(e) => warn!("ignoring malformed settings push: {e}"),
                    }
                } else if p.topic == time_set_topic {
                    info!("time received — acknowledging");
                    let topic = format!("{device_id}/time/ready");
                    if let Err(e) = client
                        .publish(topic, QoS::AtLeastOnce, false, b"{}".to_vec())
                        .await
                    {
                        error!("time/ready publish failed: {e}");
                    }
                } else if p.topic == weather_topic {
                    info!(bytes = p.payload.len(), "weather push received");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
