use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

pub(crate) const SOURCE_DEVICE: &str = "esp";
pub(crate) const SOURCE_WEATHER: &str = "weather_api";

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row / aggregate types
// ---------------------------------------------------------------------------

/// One merged reading-stream point. Device-sourced rows populate the `*_in`
/// pair; weather-sourced rows the `*_out` pair — never both.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SeriesPoint {
    pub ts: i64,
    pub temp_in: Option<f64>,
    pub hum_in: Option<f64>,
    pub temp_out: Option<f64>,
    pub hum_out: Option<f64>,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub total_records: i64,
    pub esp_records: i64,
    pub weather_records: i64,
    pub temp_in: MetricStats,
    pub hum_in: MetricStats,
    pub temp_out: MetricStats,
    pub hum_out: MetricStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayRollup {
    pub date: String, // YYYY-MM-DD
    pub records: i64,
    pub temp_avg: Option<f64>,
    pub hum_avg: Option<f64>,
    pub outside_temp_avg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeekStats {
    pub period_start: String,
    pub period_end: String,
    pub summary: StatsSummary,
    pub daily: Vec<DayRollup>,
    /// Second-half minus first-half average indoor temperature, only when
    /// at least 4 days of the window actually have data.
    pub trend: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct RawStats {
    total_records: i64,
    esp_records: Option<i64>,
    weather_records: Option<i64>,
    avg_temp_in: Option<f64>,
    min_temp_in: Option<f64>,
    max_temp_in: Option<f64>,
    avg_hum_in: Option<f64>,
    min_hum_in: Option<f64>,
    max_hum_in: Option<f64>,
    avg_temp_out: Option<f64>,
    min_temp_out: Option<f64>,
    max_temp_out: Option<f64>,
    avg_hum_out: Option<f64>,
    min_hum_out: Option<f64>,
    max_hum_out: Option<f64>,
}

impl From<RawStats> for StatsSummary {
    fn from(r: RawStats) -> Self {
        StatsSummary {
            total_records: r.total_records,
            esp_records: r.esp_records.unwrap_or(0),
            weather_records: r.weather_records.unwrap_or(0),
            temp_in: MetricStats {
                avg: r.avg_temp_in,
                min: r.min_temp_in,
                max: r.max_temp_in,
            },
            hum_in: MetricStats {
                avg: r.avg_hum_in,
                min: r.min_hum_in,
                max: r.max_hum_in,
            },
            temp_out: MetricStats {
                avg: r.avg_temp_out,
                min: r.min_temp_out,
                max: r.max_temp_out,
            },
            hum_out: MetricStats {
                avg: r.avg_hum_out,
                min: r.min_hum_out,
                max: r.max_hum_out,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Down-sampling
// ---------------------------------------------------------------------------

/// Which row of an aggregated chunk donates the representative timestamp.
/// Window queries use the first row; report-record formatting the middle
/// one. The asymmetry is load-bearing for existing consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TsRule {
    ChunkFirst,
    ChunkMiddle,
}

fn avg_of(vals: &[f64]) -> Option<f64> {
    if vals.is_empty() {
        None
    } else {
        Some(vals.iter().sum::<f64>() / vals.len() as f64)
    }
}

/// Fixed-size chunk aggregation down to at most `max_points` points.
/// Indoor values are averaged over the non-null members of each chunk;
/// outdoor values carry the last non-null value seen, across chunk
/// boundaries (first gap-fill phase).
pub(crate) fn downsample(rows: &[SeriesPoint], max_points: usize, rule: TsRule) -> Vec<SeriesPoint> {
    let chunk_size = (rows.len() / max_points.max(1)).max(1);

    let mut out = Vec::with_capacity(rows.len() / chunk_size + 1);
    let mut last_temp_out: Option<f64> = None;
    let mut last_hum_out: Option<f64> = None;

    for chunk in rows.chunks(chunk_size) {
        let temp_vals: Vec<f64> = chunk.iter().filter_map(|r| r.temp_in).collect();
        let hum_vals: Vec<f64> = chunk.iter().filter_map(|r| r.hum_in).collect();

        // Last non-null outdoor value within the chunk.
        let mut chunk_temp_out = None;
        let mut chunk_hum_out = None;
        for r in chunk {
            if r.temp_out.is_some() {
                chunk_temp_out = r.temp_out;
            }
            if r.hum_out.is_some() {
                chunk_hum_out = r.hum_out;
            }
        }
        if chunk_temp_out.is_some() {
            last_temp_out = chunk_temp_out;
        }
        if chunk_hum_out.is_some() {
            last_hum_out = chunk_hum_out;
        }

        let rep = match rule {
            TsRule::ChunkFirst => &chunk[0],
            TsRule::ChunkMiddle => &chunk[chunk.len() / 2],
        };

        out.push(SeriesPoint {
            ts: rep.ts,
            temp_in: avg_of(&temp_vals),
            hum_in: avg_of(&hum_vals),
            temp_out: last_temp_out,
            hum_out: last_hum_out,
            device_id: chunk[0].device_id.clone(),
        });
    }

    out
}

/// Final gap-fill phase: forward-fill outdoor values starting from nothing.
/// Points before the first outdoor reading keep their gaps.
pub(crate) fn fill_outdoor_gaps(points: &mut [SeriesPoint]) {
    let mut last_temp_out: Option<f64> = None;
    let mut last_hum_out: Option<f64> = None;
    for p in points.iter_mut() {
        if p.temp_out.is_some() {
            last_temp_out = p.temp_out;
        } else {
            p.temp_out = last_temp_out;
        }
        if p.hum_out.is_some() {
            last_hum_out = p.hum_out;
        } else {
            p.hum_out = last_hum_out;
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Store {
    /// db_url examples:
    /// - "sqlite:/var/lib/greenhouse/gateway.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Appends
    // ----------------------------

    pub async fn append_device_reading(
        &self,
        temp: f64,
        hum: f64,
        device_id: &str,
        ts: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (ts, temp_in, hum_in, device_id, source)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(temp)
        .bind(hum)
        .bind(device_id)
        .bind(SOURCE_DEVICE)
        .execute(&self.pool)
        .await
        .context("append_device_reading failed")?;
        Ok(())
    }

    pub async fn append_weather_reading(&self, temp: f64, hum: f64, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (ts, temp_out, hum_out, source)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(temp)
        .bind(hum)
        .bind(SOURCE_WEATHER)
        .execute(&self.pool)
        .await
        .context("append_weather_reading failed")?;
        Ok(())
    }

    // ----------------------------
    // Raw range fetch
    // ----------------------------

    /// Rows in [start, end] ascending. A device filter still admits weather
    /// rows — they carry no device id.
    async fn fetch_range(
        &self,
        start: i64,
        end: i64,
        device_id: Option<&str>,
    ) -> Result<Vec<SeriesPoint>> {
        let rows = match device_id {
            Some(dev) => {
                sqlx::query_as::<_, SeriesPoint>(
                    r#"
                    SELECT ts, temp_in, hum_in, temp_out, hum_out, device_id
                    FROM telemetry
                    WHERE ts >= ? AND ts <= ?
                      AND (device_id = ? OR device_id IS NULL)
                    ORDER BY ts ASC
                    "#,
                )
                .bind(start)
                .bind(end)
                .bind(dev)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, SeriesPoint>(
                    r#"
                    SELECT ts, temp_in, hum_in, temp_out, hum_out, device_id
                    FROM telemetry
                    WHERE ts >= ? AND ts <= ?
                    ORDER BY ts ASC
                    "#,
                )
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
            }
        };
        rows.context("fetch_range failed")
    }

    // ----------------------------
    // Windowed query (charts)
    // ----------------------------

    /// History for the last `hours`, down-sampled to at most `max_points`.
    /// Fetches one extra hour so outdoor values can carry forward into the
    /// window start, then truncates back to the requested window.
    pub async fn query_window(
        &self,
        now: i64,
        hours: i64,
        device_id: Option<&str>,
        max_points: usize,
    ) -> Result<Vec<SeriesPoint>> {
        let extended_start = now - (hours + 1) * 3600;
        let rows = self.fetch_range(extended_start, now, device_id).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut points = if rows.len() > max_points {
            downsample(&rows, max_points, TsRule::ChunkFirst)
        } else {
            rows
        };

        let cutoff = now - hours * 3600;
        points.retain(|p| p.ts >= cutoff);
        fill_outdoor_gaps(&mut points);
        Ok(points)
    }

    /// Down-sampled records over a calendar range, for report formatting.
    /// Same pipeline as `query_window` but the representative timestamp is
    /// the chunk's middle row.
    pub async fn records_for_range(
        &self,
        start: i64,
        end: i64,
        device_id: Option<&str>,
        max_points: usize,
    ) -> Result<Vec<SeriesPoint>> {
        let rows = self.fetch_range(start, end, device_id).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut points = if rows.len() > max_points {
            downsample(&rows, max_points, TsRule::ChunkMiddle)
        } else {
            rows
        };
        fill_outdoor_gaps(&mut points);
        Ok(points)
    }

    // ----------------------------
    // Aggregates
    // ----------------------------

    async fn stats_for_range(
        &self,
        start: i64,
        end: i64,
        device_id: Option<&str>,
    ) -> Result<StatsSummary> {
        const SELECT: &str = r#"
            SELECT
                COUNT(*) as total_records,
                SUM(CASE WHEN temp_in IS NOT NULL THEN 1 ELSE 0 END) as esp_records,
                SUM(CASE WHEN temp_out IS NOT NULL THEN 1 ELSE 0 END) as weather_records,
                AVG(temp_in) as avg_temp_in,
                MIN(temp_in) as min_temp_in,
                MAX(temp_in) as max_temp_in,
                AVG(hum_in) as avg_hum_in,
                MIN(hum_in) as min_hum_in,
                MAX(hum_in) as max_hum_in,
                AVG(temp_out) as avg_temp_out,
                MIN(temp_out) as min_temp_out,
                MAX(temp_out) as max_temp_out,
                AVG(hum_out) as avg_hum_out,
                MIN(hum_out) as min_hum_out,
                MAX(hum_out) as max_hum_out
            FROM telemetry
            WHERE ts >= ? AND ts <= ?
        "#;

        let raw = match device_id {
            Some(dev) => {
                let q = format!("{SELECT} AND (device_id = ? OR device_id IS NULL)");
                sqlx::query_as::<_, RawStats>(&q)
                    .bind(start)
                    .bind(end)
                    .bind(dev)
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as::<_, RawStats>(SELECT)
                    .bind(start)
                    .bind(end)
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .context("stats_for_range failed")?;

        Ok(raw.into())
    }

    /// count/avg/min/max per metric over the last `hours`, straight off the
    /// time predicate — no chunking involved.
    pub async fn stats_for_window(
        &self,
        now: i64,
        hours: i64,
        device_id: Option<&str>,
    ) -> Result<StatsSummary> {
        self.stats_for_range(now - hours * 3600, now, device_id)
            .await
    }

    /// Aggregates bounded by one local calendar day. `None` when the day
    /// holds no rows at all.
    pub async fn stats_for_calendar_day(
        &self,
        day_start: i64,
        day_end: i64,
        device_id: Option<&str>,
    ) -> Result<Option<StatsSummary>> {
        let summary = self.stats_for_range(day_start, day_end, device_id).await?;
        if summary.total_records == 0 {
            return Ok(None);
        }
        Ok(Some(summary))
    }

    /// Weekly aggregates over a list of (day_start, day_end, date-label)
    /// calendar windows, with per-day rollups and the half-vs-half indoor
    /// temperature trend.
    pub async fn stats_for_calendar_week(
        &self,
        days: &[(i64, i64, String)],
        device_id: Option<&str>,
    ) -> Result<Option<WeekStats>> {
        let Some(first) = days.first() else {
            return Ok(None);
        };
        let last = days.last().expect("non-empty");

        let summary = self.stats_for_range(first.0, last.1, device_id).await?;
        if summary.total_records == 0 {
            return Ok(None);
        }

        let mut daily = Vec::with_capacity(days.len());
        for (start, end, date) in days {
            let day = self.stats_for_range(*start, *end, device_id).await?;
            daily.push(DayRollup {
                date: date.clone(),
                records: day.total_records,
                temp_avg: day.temp_in.avg,
                hum_avg: day.hum_in.avg,
                outside_temp_avg: day.temp_out.avg,
            });
        }

        let trend = weekly_trend(&daily);

        Ok(Some(WeekStats {
            period_start: first.2.clone(),
            period_end: last.2.clone(),
            summary,
            daily,
            trend,
        }))
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Delete rows strictly older than `days`. Returns the count removed.
    pub async fn purge_older_than(&self, now: i64, days: i64) -> Result<u64> {
        let cutoff = now - days * 86_400;
        let res = sqlx::query("DELETE FROM telemetry WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("purge_older_than failed")?;
        Ok(res.rows_affected())
    }
}

/// Average indoor temperature of the second half of the data-bearing days
/// minus the first half. Needs at least 4 days with data.
fn weekly_trend(daily: &[DayRollup]) -> Option<f64> {
    let with_data: Vec<f64> = daily.iter().filter_map(|d| d.temp_avg).collect();
    if with_data.len() < 4 {
        return None;
    }
    let mid = with_data.len() / 2;
    let first = avg_of(&with_data[..mid])?;
    let second = avg_of(&with_data[mid..])?;
    Some(second - first)
}

// ===========================================================================
// Tests
// ===========================================================================
