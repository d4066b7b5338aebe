use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

// ---------------------------------------------------------------------------
// Provider response (Yandex-shaped)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    fact: Fact,
    #[serde(default)]
    forecasts: Vec<ForecastDay>,
}

#[derive(Debug, Deserialize)]
struct Fact {
    temp: i64,
    feels_like: i64,
    condition: String,
    wind_speed: f64,
    humidity: i64,
}

#[derive(Debug, Deserialize)]
struct ForecastDay {
    #[serde(default)]
    parts: HashMap<String, ForecastPart>,
}

#[derive(Debug, Deserialize)]
struct ForecastPart {
    temp_avg: Option<i64>,
}

// ---------------------------------------------------------------------------
// Provider-neutral forecast
// ---------------------------------------------------------------------------

/// What the rest of the system consumes, independent of the upstream
/// provider's shape.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub current_temp: i64,
    pub current_feels_like: i64,
    pub current_condition: String,
    pub current_wind: f64,
    pub current_humidity: i64,

    /// Today's remaining day parts.
    pub evening_temp: Option<i64>,
    pub night_temp: Option<i64>,
    /// Tomorrow's daytime average.
    pub tomorrow_temp: Option<i64>,
}

fn map_response(resp: ProviderResponse) -> Forecast {
    let part_avg = |day: Option<&ForecastDay>, part: &str| -> Option<i64> {
        day.and_then(|d| d.parts.get(part)).and_then(|p| p.temp_avg)
    };

    let today = resp.forecasts.first();
    let tomorrow = resp.forecasts.get(1);

    Forecast {
        current_temp: resp.fact.temp,
        current_feels_like: resp.fact.feels_like,
        current_condition: resp.fact.condition,
        current_wind: resp.fact.wind_speed,
        current_humidity: resp.fact.humidity,
        evening_temp: part_avg(today, "evening"),
        night_temp: part_avg(today, "night"),
        tomorrow_temp: part_avg(tomorrow, "day"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Stateless upstream forecast client. One bounded HTTP call per fetch;
/// every failure mode collapses to `None` after a warning.
pub struct ForecastClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ForecastClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build forecast http client")?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub async fn fetch(&self, lat: f64, lon: f64) -> Option<Forecast> {
        let resp = match self
            .http
            .get(&self.base_url)
            .header("X-Yandex-Weather-Key", &self.api_key)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("lang", "ru_RU".to_string()),
                ("limit", "2".to_string()),
            ])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("weather api request failed: {e}");
                return None;
            }
        };

        let resp = match resp.error_for_status() {
            Ok(r) => r,
            Err(e) => {
                warn!("weather api returned error status: {e}");
                return None;
            }
        };

        match resp.json::<ProviderResponse>().await {
            Ok(body) => Some(map_response(body)),
            Err(e) => {
                warn!("weather api response unparsable: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
