use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

use crate::db::{MetricStats, SeriesPoint, StatsSummary, WeekStats};

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.1}", v),
        None => "—".to_string(),
    }
}

fn fmt_metric(m: &MetricStats) -> String {
    format!(
        "average {}, from {} to {}",
        fmt_opt(m.avg),
        fmt_opt(m.min),
        fmt_opt(m.max)
    )
}

pub(crate) fn fmt_time_hhmm(ts: i64, offset: UtcOffset) -> String {
    match OffsetDateTime::from_unix_timestamp(ts) {
        Ok(dt) => {
            let local = dt.to_offset(offset);
            format!("{:02}:{:02}", local.hour(), local.minute())
        }
        Err(_) => "--:--".to_string(),
    }
}

/// Compact the down-sampled records into at most 10 prompt lines.
fn format_records(records: &[SeriesPoint], offset: UtcOffset) -> String {
    if records.is_empty() {
        return "No data".to_string();
    }

    let step = (records.len() / 10).max(1);
    records
        .iter()
        .step_by(step)
        .take(10)
        .map(|r| {
            format!(
                "{}: indoor {}°C/{}%, outdoor {}°C/{}%",
                fmt_time_hhmm(r.ts, offset),
                fmt_opt(r.temp_in),
                fmt_opt(r.hum_in),
                fmt_opt(r.temp_out),
                fmt_opt(r.hum_out),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_daily_rollups(stats: &WeekStats) -> String {
    if stats.daily.is_empty() {
        return "No data".to_string();
    }
    stats
        .daily
        .iter()
        .map(|d| {
            // MM-DD is enough inside a one-week window.
            let short_date = d.date.get(5..).unwrap_or(&d.date);
            format!(
                "{}: indoor {}°C/{}%, outside {}°C",
                short_date,
                fmt_opt(d.temp_avg),
                fmt_opt(d.hum_avg),
                fmt_opt(d.outside_temp_avg),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn trend_sentence(trend: Option<f64>) -> String {
    match trend {
        Some(t) if t > 0.05 => format!("Indoor temperature rose {:.1}°C over the week.", t),
        Some(t) if t < -0.05 => format!("Indoor temperature fell {:.1}°C over the week.", t.abs()),
        Some(_) => "Indoor temperature did not change over the week.".to_string(),
        None => "Not enough data to compute a weekly trend.".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

/// Fixed template, injected numbers only — the prompt for a given day's
/// statistics is fully deterministic.
pub fn daily_prompt(
    date: &str,
    stats: &StatsSummary,
    records: &[SeriesPoint],
    offset: UtcOffset,
) -> String {
    format!(
        "You are the assistant of a smart greenhouse system. Analyze the \
readings for {date} and write a friendly report.

Daily statistics:
- Indoor temperature: {temp_in} °C
- Indoor humidity: {hum_in} %

Outside:
- Temperature: {temp_out} °C
- Humidity: {hum_out} %

How the readings changed over the day (time, indoor, outdoor):
{records}

Records: {total} total (device: {esp}, weather: {weather})

Write a short (3-5 sentences) friendly report in plain text, no markdown. \
Mention whether the day was typical, point out anomalies, and give advice \
if needed.",
        date = date,
        temp_in = fmt_metric(&stats.temp_in),
        hum_in = fmt_metric(&stats.hum_in),
        temp_out = fmt_metric(&stats.temp_out),
        hum_out = fmt_metric(&stats.hum_out),
        records = format_records(records, offset),
        total = stats.total_records,
        esp = stats.esp_records,
        weather = stats.weather_records,
    )
}

pub fn weekly_prompt(stats: &WeekStats) -> String {
    let s = &stats.summary;
    format!(
        "You are the assistant of a smart greenhouse system. Analyze the \
readings for the week {start} to {end} and write a friendly report.

Weekly summary:
- Indoor temperature: {temp_in} °C
- Indoor humidity: {hum_in} %
- Outside temperature: {temp_out} °C
- Outside humidity: {hum_out} %

Trend: {trend}

Per day:
{daily}

Records: {total} total (device: {esp}, weather: {weather})

Write a brief (5-7 sentences) friendly report in plain text, no markdown. \
Describe the overall picture, name the warmest and coldest day, compare \
indoor and outdoor conditions, and give advice if needed.",
        start = stats.period_start,
        end = stats.period_end,
        temp_in = fmt_metric(&s.temp_in),
        hum_in = fmt_metric(&s.hum_in),
        temp_out = fmt_metric(&s.temp_out),
        hum_out = fmt_metric(&s.hum_out),
        trend = trend_sentence(stats.trend),
        daily = format_daily_rollups(stats),
        total = s.total_records,
        esp = s.esp_records,
        weather = s.weather_records,
    )
}

// ---------------------------------------------------------------------------
// Text-generation client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// OpenAI-compatible chat-completions client. Treated as a black box:
/// one request, one trimmed answer, any failure is `None`.
pub struct ReportClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ReportClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build report http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub async fn generate(&self, prompt: &str) -> Option<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
        });

        let resp = match self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("report api request failed: {e}");
                return None;
            }
        };

        let resp = match resp.error_for_status() {
            Ok(r) => r,
            Err(e) => {
                warn!("report api returned error status: {e}");
                return None;
            }
        };

        let parsed = match resp.json::<ChatResponse>().await {
            Ok(p) => p,
            Err(e) => {
                warn!("report api response unparsable: {e}");
                return None;
            }
        };

        match parsed.choices.into_iter().next() {
            Some(choice) => Some(choice.message.content.trim().to_string()),
            None => {
                warn!("report api returned no choices");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
