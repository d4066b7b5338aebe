use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Topic namespace
// ---------------------------------------------------------------------------
//
// All topics are `{device_id}/{suffix}`.
// device → backend: telemetry, config/update, weather/request, time/ready
// backend → device: weather, config/get, config/set, time/set

pub(crate) const SUFFIX_TELEMETRY: &str = "telemetry";
pub(crate) const SUFFIX_CONFIG_UPDATE: &str = "config/update";
pub(crate) const SUFFIX_WEATHER_REQUEST: &str = "weather/request";
pub(crate) const SUFFIX_TIME_READY: &str = "time/ready";

pub(crate) const SUFFIX_WEATHER: &str = "weather";
pub(crate) const SUFFIX_CONFIG_GET: &str = "config/get";
pub(crate) const SUFFIX_CONFIG_SET: &str = "config/set";
pub(crate) const SUFFIX_TIME_SET: &str = "time/set";

/// Split "device/suffix" into (device_id, suffix). The suffix may itself
/// contain slashes ("config/update").
pub(crate) fn parse_topic(topic: &str) -> Option<(&str, &str)> {
    let (device_id, suffix) = topic.split_once('/')?;
    if device_id.is_empty() || suffix.is_empty() {
        return None;
    }
    Some((device_id, suffix))
}

pub(crate) fn outbound_topic(device_id: &str, suffix: &str) -> String {
    format!("{device_id}/{suffix}")
}

/// The four device→backend topics the gateway listens on.
pub(crate) fn inbound_topics(device_id: &str) -> [String; 4] {
    [
        outbound_topic(device_id, SUFFIX_TELEMETRY),
        outbound_topic(device_id, SUFFIX_CONFIG_UPDATE),
        outbound_topic(device_id, SUFFIX_WEATHER_REQUEST),
        outbound_topic(device_id, SUFFIX_TIME_READY),
    ]
}

/// Subscribe to all inbound topics at QoS 1. Called on every ConnAck so
/// subscriptions survive broker reconnects.
pub(crate) async fn subscribe_inbound(client: &AsyncClient, device_id: &str) {
    for topic in inbound_topics(device_id) {
        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
            warn!(%topic, "subscribe failed: {e}");
        } else {
            debug!(%topic, "subscribed");
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// Telemetry as the firmware publishes it. Unknown fields are ignored;
/// optional fields default to absent.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryMsg {
    pub temperature: f64,
    pub humidity: f64,
    pub free_memory: Option<i64>,
    pub uptime: Option<i64>,
    pub bluetooth_is_active: Option<bool>,
}

/// Field-for-field mirror of the on-device configuration struct. The
/// gateway reads and forwards it, never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    // Display mode: 0 always-on, 1 auto, 2 smart.
    pub display_mode: u8,

    pub day_on_hour: u8,
    pub day_on_minute: u8,
    pub day_off_hour: u8,
    pub day_off_minute: u8,

    pub night_on_hour: u8,
    pub night_on_minute: u8,
    pub night_off_hour: u8,
    pub night_off_minute: u8,

    pub toilet_on_hour: u8,
    pub toilet_on_minute: u8,
    pub toilet_off_hour: u8,
    pub toilet_off_minute: u8,

    // false = automatic schedule, true = manual override.
    pub relay_mode: bool,
    pub manual_day_state: bool,
    pub manual_night_state: bool,

    pub display_timeout: u32,
    pub display_change_mode_timeout: u32,

    pub fan_delay: u32,
    pub fan_duration: u32,

    pub offline_mode_active: bool,
    pub show_forecast_screen: bool,
    pub show_temp_screen: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            display_mode: 1,
            day_on_hour: 8,
            day_on_minute: 0,
            day_off_hour: 22,
            day_off_minute: 0,
            night_on_hour: 22,
            night_on_minute: 0,
            night_off_hour: 8,
            night_off_minute: 0,
            toilet_on_hour: 8,
            toilet_on_minute: 0,
            toilet_off_hour: 20,
            toilet_off_minute: 0,
            relay_mode: false,
            manual_day_state: false,
            manual_night_state: false,
            display_timeout: 30,
            display_change_mode_timeout: 30,
            fan_delay: 60,
            fan_duration: 5,
            offline_mode_active: false,
            show_forecast_screen: false,
            show_temp_screen: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Weather as pushed to the device display. All four day-part temperatures
/// are required by the firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherForDevice {
    pub temp: i64,
    pub feels_like: i64,
    pub condition: String,
    pub humidity: i64,
    pub wind_speed: f64,

    pub morning_temp: i64,
    pub day_temp: i64,
    pub evening_temp: i64,
    pub night_temp: i64,

    // "HH:MM" of the snapshot fetch, shown on the device.
    pub update_at: String,
}

/// Wall-clock time pushed to the device RTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSetPayload {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

// ---------------------------------------------------------------------------
// Inbound decode + routing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum InboundEvent {
    Telemetry { device_id: String, msg: TelemetryMsg },
    SettingsUpdate { device_id: String, settings: DeviceSettings },
    WeatherRequest { device_id: String },
    TimeReady { device_id: String },
}

/// Decode an inbound publish into a typed event. Payload validation lives
/// here: malformed JSON or schema-violating payloads are logged and dropped
/// without reaching the orchestrator.
pub(crate) fn decode_inbound(topic: &str, payload: &[u8]) -> Option<InboundEvent> {
    let Some((device_id, suffix)) = parse_topic(topic) else {
        warn!(%topic, "unroutable topic");
        return None;
    };

    match suffix {
        SUFFIX_TELEMETRY => match serde_json::from_slice::<TelemetryMsg>(payload) {
            Ok(msg) => Some(InboundEvent::Telemetry {
                device_id: device_id.to_string(),
                msg,
            }),
            Err(e) => {
                warn!(device = %device_id, "invalid telemetry payload: {e}");
                None
            }
        },
        SUFFIX_CONFIG_UPDATE => match serde_json::from_slice::<DeviceSettings>(payload) {
            Ok(settings) => Some(InboundEvent::SettingsUpdate {
                device_id: device_id.to_string(),
                settings,
            }),
            Err(e) => {
                warn!(device = %device_id, "invalid settings payload: {e}");
                None
            }
        },
        SUFFIX_WEATHER_REQUEST => Some(InboundEvent::WeatherRequest {
            device_id: device_id.to_string(),
        }),
        SUFFIX_TIME_READY => Some(InboundEvent::TimeReady {
            device_id: device_id.to_string(),
        }),
        other => {
            debug!(device = %device_id, suffix = %other, "unhandled topic suffix");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound device link
// ---------------------------------------------------------------------------

/// Everything the orchestrator may send to the device. Each method returns
/// true when the publish was handed to the broker, false otherwise — send
/// paths never error.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn send_weather(&self, device_id: &str, weather: &WeatherForDevice) -> bool;
    async fn push_settings(&self, device_id: &str, settings: &DeviceSettings) -> bool;
    async fn request_settings(&self, device_id: &str) -> bool;
    async fn send_time(&self, device_id: &str, time: &TimeSetPayload) -> bool;
}

/// MQTT-backed link. The connected flag is owned by the event-loop task in
/// main; reconnection itself is the event loop's job, so a down link simply
/// drops the publish with a warning.
pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttLink {
    pub fn new(client: AsyncClient, connected: Arc<AtomicBool>) -> Self {
        Self { client, connected }
    }

    async fn publish_json<T: Serialize>(&self, topic: String, payload: &T, what: &str) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            warn!(%topic, "mqtt link down — {what} not sent");
            return false;
        }

        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                error!(%topic, "failed to serialize {what}: {e}");
                return false;
            }
        };

        match self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, bytes)
            .await
        {
            Ok(()) => {
                debug!(%topic, "{what} published");
                true
            }
            Err(e) => {
                error!(%topic, "failed to publish {what}: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl DeviceLink for MqttLink {
    async fn send_weather(&self, device_id: &str, weather: &WeatherForDevice) -> bool {
        self.publish_json(outbound_topic(device_id, SUFFIX_WEATHER), weather, "weather")
            .await
    }

    async fn push_settings(&self, device_id: &str, settings: &DeviceSettings) -> bool {
        self.publish_json(
            outbound_topic(device_id, SUFFIX_CONFIG_SET),
            settings,
            "settings",
        )
        .await
    }

    async fn request_settings(&self, device_id: &str) -> bool {
        // Empty object: the request carries no parameters.
        self.publish_json(
            outbound_topic(device_id, SUFFIX_CONFIG_GET),
            &serde_json::json!({}),
            "settings request",
        )
        .await
    }

    async fn send_time(&self, device_id: &str, time: &TimeSetPayload) -> bool {
        self.publish_json(outbound_topic(device_id, SUFFIX_TIME_SET), time, "time")
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
