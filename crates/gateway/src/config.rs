//! TOML config loading, env-var secret overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub weather: WeatherConfig,
    pub session: SessionConfig,
    pub time_sync: TimeSyncConfig,
    pub reporting: ReportingConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "greenhouse-gateway".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    /// Fixed offset of the device's wall clock from UTC.
    pub utc_offset_hours: i8,
    /// Every Nth telemetry sample is written to the store.
    pub telemetry_persist_every: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "greenhouse_01".to_string(),
            utc_offset_hours: 4,
            telemetry_persist_every: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:gateway.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub base_url: String,
    pub api_key: String,
    pub lat: f64,
    pub lon: f64,
    pub refresh_interval_secs: u64,
    /// Upstream fetches allowed per calendar day before the loop reuses
    /// the cache instead.
    pub daily_call_budget: i64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.weather.yandex.ru/v2/forecast".to_string(),
            api_key: String::new(),
            lat: 56.8526,
            lon: 53.2047,
            refresh_interval_secs: 1800,
            daily_call_budget: 28,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub online_threshold_secs: u64,
    pub dead_threshold_secs: u64,
    pub settings_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            online_threshold_secs: 120,
            dead_threshold_secs: 300,
            settings_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub interval_secs: u64,
    pub min_days_between_syncs: i64,
    pub ack_timeout_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 43_200,
            min_days_between_syncs: 2,
            ack_timeout_secs: 30,
            initial_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: 30 }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load the config file, falling back to defaults when it does not exist.
/// Secrets are then overridden from env and the result validated.
pub fn load(path: &str) -> Result<Config> {
    let mut cfg = if Path::new(path).exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file: {path}"))?
    } else {
        info!(%path, "no config file found, using defaults");
        Config::default()
    };

    if let Ok(key) = std::env::var("WEATHER_API_KEY") {
        cfg.weather.api_key = key;
    }
    if let Ok(key) = std::env::var("AI_API_KEY") {
        cfg.reporting.api_key = key;
    }
    if let Ok(user) = std::env::var("MQTT_USERNAME") {
        cfg.mqtt.username = Some(user);
    }
    if let Ok(pass) = std::env::var("MQTT_PASSWORD") {
        cfg.mqtt.password = Some(pass);
    }

    cfg.validate()?;
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device.id.trim().is_empty() {
            errors.push("device.id is empty".to_string());
        }
        if !(-12..=14).contains(&self.device.utc_offset_hours) {
            errors.push(format!(
                "device.utc_offset_hours {} out of range [-12, 14]",
                self.device.utc_offset_hours
            ));
        }
        if self.device.telemetry_persist_every == 0 {
            errors.push("device.telemetry_persist_every must be positive".to_string());
        }

        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }

        if !(-90.0..=90.0).contains(&self.weather.lat) {
            errors.push(format!("weather.lat {} out of range [-90, 90]", self.weather.lat));
        }
        if !(-180.0..=180.0).contains(&self.weather.lon) {
            errors.push(format!(
                "weather.lon {} out of range [-180, 180]",
                self.weather.lon
            ));
        }
        if self.weather.refresh_interval_secs == 0 {
            errors.push("weather.refresh_interval_secs must be positive".to_string());
        }
        if self.weather.daily_call_budget <= 0 {
            errors.push(format!(
                "weather.daily_call_budget must be positive, got {}",
                self.weather.daily_call_budget
            ));
        }

        if self.session.heartbeat_interval_secs == 0 {
            errors.push("session.heartbeat_interval_secs must be positive".to_string());
        }
        if self.session.online_threshold_secs == 0 {
            errors.push("session.online_threshold_secs must be positive".to_string());
        }
        if self.session.dead_threshold_secs <= self.session.online_threshold_secs {
            errors.push(format!(
                "session.dead_threshold_secs ({}) must be greater than online_threshold_secs ({})",
                self.session.dead_threshold_secs, self.session.online_threshold_secs
            ));
        }
        if self.session.settings_timeout_secs == 0 {
            errors.push("session.settings_timeout_secs must be positive".to_string());
        }

        if self.time_sync.interval_secs == 0 {
            errors.push("time_sync.interval_secs must be positive".to_string());
        }
        if self.time_sync.min_days_between_syncs <= 0 {
            errors.push(format!(
                "time_sync.min_days_between_syncs must be positive, got {}",
                self.time_sync.min_days_between_syncs
            ));
        }
        if self.time_sync.ack_timeout_secs == 0 {
            errors.push("time_sync.ack_timeout_secs must be positive".to_string());
        }

        if self.retention.days <= 0 {
            errors.push(format!(
                "retention.days must be positive, got {}",
                self.retention.days
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn defaults_match_protocol_timings() {
        let cfg = Config::default();
        assert_eq!(cfg.session.online_threshold_secs, 120);
        assert_eq!(cfg.session.dead_threshold_secs, 300);
        assert_eq!(cfg.session.settings_timeout_secs, 5);
        assert_eq!(cfg.session.heartbeat_interval_secs, 60);
        assert_eq!(cfg.weather.refresh_interval_secs, 1800);
        assert_eq!(cfg.weather.daily_call_budget, 28);
        assert_eq!(cfg.time_sync.interval_secs, 43_200);
        assert_eq!(cfg.time_sync.ack_timeout_secs, 30);
        assert_eq!(cfg.time_sync.min_days_between_syncs, 2);
        assert_eq!(cfg.device.telemetry_persist_every, 5);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [mqtt]
            host = "broker.lan"
            port = 8883

            [device]
            id = "greenhouse_02"

            [session]
            settings_timeout_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.device.id, "greenhouse_02");
        assert_eq!(cfg.session.settings_timeout_secs, 10);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.web.port, 8080);
        assert_eq!(cfg.weather.daily_call_budget, 28);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.device.id, "greenhouse_01");
        assert!(cfg.mqtt.username.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut cfg = Config::default();
        cfg.device.id = " ".to_string();
        cfg.weather.lat = 123.0;
        cfg.session.dead_threshold_secs = 60; // below online threshold
        cfg.retention.days = 0;

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("4 errors"), "got: {err}");
        assert!(err.contains("device.id is empty"));
        assert!(err.contains("weather.lat"));
        assert!(err.contains("dead_threshold_secs"));
        assert!(err.contains("retention.days"));
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg = Config::default();
        cfg.weather.refresh_interval_secs = 0;
        cfg.session.heartbeat_interval_secs = 0;
        cfg.time_sync.interval_secs = 0;

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("weather.refresh_interval_secs"));
        assert!(err.contains("session.heartbeat_interval_secs"));
        assert!(err.contains("time_sync.interval_secs"));
    }

    #[test]
    fn utc_offset_bounds() {
        let mut cfg = Config::default();
        cfg.device.utc_offset_hours = -13;
        assert!(cfg.validate().is_err());
        cfg.device.utc_offset_hours = 14;
        assert!(cfg.validate().is_ok());
    }
}
