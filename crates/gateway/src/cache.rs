use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::warn;

/// Single cached location; the deployment serves one greenhouse.
const SNAPSHOT_KEY: &str = "primary";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The last fetched external forecast, shared by every downstream consumer.
/// Overwritten wholesale on each successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub current_temp: i64,
    pub current_feels_like: i64,
    pub current_condition: String,
    pub humidity: i64,
    pub wind_speed: f64,

    pub morning_temp: Option<i64>,
    pub day_temp: Option<i64>,
    pub evening_temp: Option<i64>,
    pub night_temp: Option<i64>,

    pub fetched_at: i64,
    /// Always fetched_at + 60 min.
    pub expires_at: i64,
    pub api_calls_today: i64,
}

impl WeatherSnapshot {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Key/value store for the weather snapshot, the per-day upstream call
/// counter, the per-device time-sync marker and the access keys. Every
/// operation degrades to a "cache miss / sync required" answer when the
/// backing store is unreachable — nothing here raises to the caller.
#[derive(Clone)]
pub struct WeatherCache {
    pool: Pool<Sqlite>,
}

impl WeatherCache {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Snapshot
    // ----------------------------

    pub async fn snapshot(&self) -> Option<WeatherSnapshot> {
        let row: Option<(String,)> =
            match sqlx::query_as("SELECT payload FROM weather_cache WHERE location = ?")
                .bind(SNAPSHOT_KEY)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("weather cache read failed: {e}");
                    return None;
                }
            };

        let (payload,) = row?;
        match serde_json::from_str(&payload) {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!("weather cache holds unparsable payload: {e}");
                None
            }
        }
    }

    /// Overwrite the snapshot and bump the day's upstream call counter.
    /// `day` is the local calendar date (YYYY-MM-DD); keying the counter by
    /// date is what makes it reset at the day boundary.
    pub async fn store_snapshot(&self, snap: &WeatherSnapshot, day: &str) {
        let payload = match serde_json::to_string(snap) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize weather snapshot: {e}");
                return;
            }
        };

        let res = sqlx::query(
            r#"
            INSERT INTO weather_cache (location, payload) VALUES (?, ?)
            ON CONFLICT(location) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(SNAPSHOT_KEY)
        .bind(&payload)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            warn!("weather cache write failed: {e}");
            return;
        }

        let res = sqlx::query(
            r#"
            INSERT INTO weather_api_calls (day, calls) VALUES (?, 1)
            ON CONFLICT(day) DO UPDATE SET calls = calls + 1
            "#,
        )
        .bind(day)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            warn!("api call counter update failed: {e}");
        }
    }

    /// Upstream calls already spent on the given local date. Unknown day or
    /// unreachable store both read as zero.
    pub async fn calls_today(&self, day: &str) -> i64 {
        match sqlx::query_as::<_, (i64,)>("SELECT calls FROM weather_api_calls WHERE day = ?")
            .bind(day)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some((calls,))) => calls,
            Ok(None) => 0,
            Err(e) => {
                warn!("api call counter read failed: {e}");
                0
            }
        }
    }

    // ----------------------------
    // Time sync marker
    // ----------------------------

    /// Whether the device is due for a time sync. Absent marker — or an
    /// unreachable store — means a sync is required.
    pub async fn should_sync_time(&self, device_id: &str, interval_days: i64, now: i64) -> bool {
        let row: Option<(i64,)> =
            match sqlx::query_as("SELECT last_sync_ts FROM time_sync WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(device = %device_id, "time sync marker read failed, assuming sync required: {e}");
                    return true;
                }
            };

        match row {
            None => true,
            Some((last,)) => now - last > interval_days * 86_400,
        }
    }

    pub async fn mark_sync_completed(&self, device_id: &str, now: i64) {
        let res = sqlx::query(
            r#"
            INSERT INTO time_sync (device_id, last_sync_ts) VALUES (?, ?)
            ON CONFLICT(device_id) DO UPDATE SET last_sync_ts = excluded.last_sync_ts
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            warn!(device = %device_id, "time sync marker write failed: {e}");
        }
    }

    // ----------------------------
    // Access keys
    // ----------------------------

    /// Map a presented access key to a user id. Key issuance lives outside
    /// this service; this is the verify half only.
    pub async fn validate_key(&self, key: &str) -> Option<i64> {
        match sqlx::query_as::<_, (i64,)>("SELECT user_id FROM access_keys WHERE access_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.map(|(id,)| id),
            Err(e) => {
                warn!("access key lookup failed: {e}");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_access_key(&self, key: &str, user_id: i64) {
        sqlx::query("INSERT INTO access_keys (access_key, user_id) VALUES (?, ?)")
            .bind(key)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .expect("seed access key");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
