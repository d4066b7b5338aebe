//! Device-session orchestrator: the single source of truth for "is the
//! device reachable", the only component that issues commands to the device
//! or interprets its responses, and the home of the three background loops
//! (weather refresh, heartbeat, time sync).
//!
//! Request/response exchanges ride on plain pub/sub topics with no
//! correlation ids, so correctness rests on three rules: at most one
//! outstanding exchange per kind, unconditional cleanup of the pending
//! slot, and a device-id match on every response.

use std::sync::Arc;
use std::time::Duration;

use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::cache::{WeatherCache, WeatherSnapshot};
use crate::config::Config;
use crate::db::{SeriesPoint, StatsSummary, Store};
use crate::mqtt::{
    DeviceLink, DeviceSettings, InboundEvent, TelemetryMsg, TimeSetPayload, WeatherForDevice,
};
use crate::report::{self, ReportClient};
use crate::session::{DeviceSession, DeviceStatus, TelemetrySample};
use crate::weather::ForecastClient;

// ---------------------------------------------------------------------------
// Pending exchanges
// ---------------------------------------------------------------------------

/// One slot per exchange kind. The sequence number lets a timed-out
/// requester release its own slot without stealing a newer request's.
struct Slot<T> {
    seq: u64,
    tx: oneshot::Sender<T>,
}

#[derive(Default)]
struct PendingExchanges {
    next_seq: u64,
    settings: Option<Slot<DeviceSettings>>,
    time_sync: Option<Slot<()>>,
}

impl PendingExchanges {
    fn install_settings(&mut self, tx: oneshot::Sender<DeviceSettings>) -> u64 {
        self.next_seq += 1;
        if self.settings.replace(Slot { seq: self.next_seq, tx }).is_some() {
            warn!("previous settings fetch still pending — shadowed");
        }
        self.next_seq
    }

    fn install_time_sync(&mut self, tx: oneshot::Sender<()>) -> u64 {
        self.next_seq += 1;
        if self.time_sync.replace(Slot { seq: self.next_seq, tx }).is_some() {
            warn!("previous time sync still pending — shadowed");
        }
        self.next_seq
    }

    fn take_settings(&mut self) -> Option<oneshot::Sender<DeviceSettings>> {
        self.settings.take().map(|s| s.tx)
    }

    fn take_time_sync(&mut self) -> Option<oneshot::Sender<()>> {
        self.time_sync.take().map(|s| s.tx)
    }

    fn clear_settings_if(&mut self, seq: u64) {
        if self.settings.as_ref().map(|s| s.seq) == Some(seq) {
            self.settings = None;
        }
    }

    fn clear_time_sync_if(&mut self, seq: u64) {
        if self.time_sync.as_ref().map(|s| s.seq) == Some(seq) {
            self.time_sync = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn date_label(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

/// Should the weather loop hit the upstream this tick? Only when the cache
/// is missing or expired, and the day's call budget still has room.
fn refresh_decision(cached: Option<&WeatherSnapshot>, calls: i64, budget: i64, now: i64) -> bool {
    let stale = match cached {
        None => {
            info!("no cached weather — refresh needed");
            true
        }
        Some(s) if s.is_expired(now) => true,
        Some(_) => false,
    };
    if !stale {
        return false;
    }
    if calls >= budget {
        warn!(calls, budget, "daily weather api budget spent — reusing cache");
        return false;
    }
    info!("weather cache expired — refreshing");
    true
}

/// Device display payload from a snapshot. The firmware wants all four
/// day-part temperatures; absent forecast parts fall back to the current
/// reading.
fn weather_for_device(snap: &WeatherSnapshot, offset: UtcOffset) -> WeatherForDevice {
    WeatherForDevice {
        temp: snap.current_temp,
        feels_like: snap.current_feels_like,
        condition: snap.current_condition.clone(),
        humidity: snap.humidity,
        wind_speed: snap.wind_speed,
        morning_temp: snap.morning_temp.unwrap_or(snap.current_temp),
        day_temp: snap.day_temp.unwrap_or(snap.current_temp),
        evening_temp: snap.evening_temp.unwrap_or(snap.current_temp),
        night_temp: snap.night_temp.unwrap_or(snap.current_temp),
        update_at: report::fmt_time_hhmm(snap.fetched_at, offset),
    }
}

/// Sleep that doubles as a cancellation point. Returns true on shutdown.
async fn sleep_or_shutdown(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = shutdown.changed() => true,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: Config,
    offset: UtcOffset,
    session: RwLock<DeviceSession>,
    store: Store,
    cache: WeatherCache,
    link: Arc<dyn DeviceLink>,
    forecast: ForecastClient,
    reporter: ReportClient,
    pending: Mutex<PendingExchanges>,
}

impl Orchestrator {
    /// Constructed exactly once in main and shared as `Arc<Orchestrator>`;
    /// ownership replaces the runtime singleton guard.
    pub fn new(
        cfg: Config,
        store: Store,
        cache: WeatherCache,
        link: Arc<dyn DeviceLink>,
        forecast: ForecastClient,
        reporter: ReportClient,
    ) -> Self {
        let offset = UtcOffset::from_hms(cfg.device.utc_offset_hours, 0, 0)
            .expect("utc offset validated by config");
        let session = DeviceSession::new(
            &cfg.device.id,
            cfg.session.online_threshold_secs,
            cfg.session.dead_threshold_secs,
        );
        Self {
            cfg,
            offset,
            session: RwLock::new(session),
            store,
            cache,
            link,
            forecast,
            reporter,
            pending: Mutex::new(PendingExchanges::default()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.cfg.device.id
    }

    fn now_local(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    fn today_label(&self) -> String {
        date_label(self.now_local().date())
    }

    /// Local calendar-day bounds [00:00:00, 23:59:59] as unix timestamps.
    fn day_bounds(&self, date: Date) -> (i64, i64) {
        let start = date.midnight().assume_offset(self.offset).unix_timestamp();
        (start, start + 86_399)
    }

    // ----------------------------
    // Inbound dispatch
    // ----------------------------

    /// Single entry point for every decoded inbound message. Activity is
    /// recorded before any kind-specific handling: any message ⇒ alive.
    pub async fn dispatch(&self, event: InboundEvent) {
        {
            let mut s = self.session.write().await;
            s.record_activity(self.now_local());
        }

        match event {
            InboundEvent::Telemetry { device_id, msg } => {
                self.handle_telemetry(device_id, msg).await;
            }
            InboundEvent::SettingsUpdate { device_id, settings } => {
                self.handle_settings_response(&device_id, settings).await;
            }
            InboundEvent::WeatherRequest { device_id } => {
                info!(device = %device_id, "device requested a weather push");
                self.push_cached_weather().await;
            }
            InboundEvent::TimeReady { device_id } => {
                self.handle_time_ready(&device_id).await;
            }
        }
    }

    async fn handle_telemetry(&self, device_id: String, msg: TelemetryMsg) {
        let sample = TelemetrySample {
            device_id,
            temperature: msg.temperature,
            humidity: msg.humidity,
            free_memory: msg.free_memory,
            uptime: msg.uptime,
            bluetooth_is_active: msg.bluetooth_is_active,
            timestamp: self.now_local(),
        };

        let persist = {
            let mut s = self.session.write().await;
            s.current_telemetry = Some(sample.clone());
            s.bump_persist_counter(self.cfg.device.telemetry_persist_every)
        };

        if persist {
            // The durable row carries the wall clock at persist time, not
            // the sample's own timestamp.
            let ts = self.now_local().unix_timestamp();
            match self
                .store
                .append_device_reading(sample.temperature, sample.humidity, &self.cfg.device.id, ts)
                .await
            {
                Ok(()) => info!(
                    temp = sample.temperature,
                    hum = sample.humidity,
                    "telemetry reading persisted"
                ),
                Err(e) => error!("failed to persist telemetry reading: {e}"),
            }
        }
    }

    async fn handle_settings_response(&self, device_id: &str, settings: DeviceSettings) {
        if device_id != self.cfg.device.id {
            warn!(device = %device_id, "settings response from unexpected device — discarded");
            return;
        }
        match self.pending.lock().await.take_settings() {
            Some(tx) => {
                info!(device = %device_id, "received settings from device");
                // The requester may have timed out in the meantime; a send
                // onto a dropped receiver is the losing side of that race.
                let _ = tx.send(settings);
            }
            None => warn!(device = %device_id, "unsolicited settings response — discarded"),
        }
    }

    async fn handle_time_ready(&self, device_id: &str) {
        if device_id != self.cfg.device.id {
            warn!(device = %device_id, "time sync ack from unexpected device — discarded");
            return;
        }
        match self.pending.lock().await.take_time_sync() {
            Some(tx) => {
                info!(device = %device_id, "device confirmed time sync");
                let _ = tx.send(());
            }
            None => warn!(device = %device_id, "unsolicited time sync ack — discarded"),
        }
    }

    // ----------------------------
    // Outbound commands
    // ----------------------------

    /// Push the cached snapshot to the device. No fetch is forced; an
    /// unreachable device or empty cache makes this a logged no-op.
    pub async fn push_cached_weather(&self) {
        let status = self.status().await;
        if status != DeviceStatus::Online {
            warn!(%status, "skipping weather push: device not reachable");
            return;
        }
        let Some(snap) = self.cache.snapshot().await else {
            warn!("no cached weather to push");
            return;
        };
        let payload = weather_for_device(&snap, self.offset);
        self.link.send_weather(&self.cfg.device.id, &payload).await;
    }

    /// Fire-and-forget settings push, guarded by reachability.
    pub async fn push_settings(&self, settings: &DeviceSettings) {
        let status = self.status().await;
        if status != DeviceStatus::Online {
            warn!(%status, "skipping settings push: device not reachable");
            return;
        }
        self.link.push_settings(&self.cfg.device.id, settings).await;
    }

    /// Synchronous request/response over pub/sub: ask the device for its
    /// current settings and wait (bounded) for the reply. Absence — not an
    /// error — on unreachable device, timeout, or a superseded request.
    pub async fn fetch_settings(&self) -> Option<DeviceSettings> {
        let status = self.status().await;
        if status != DeviceStatus::Online {
            warn!(%status, "skipping settings fetch: device not reachable");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.pending.lock().await.install_settings(tx);

        self.link.request_settings(&self.cfg.device.id).await;

        let timeout = Duration::from_secs(self.cfg.session.settings_timeout_secs);
        let out = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(settings)) => Some(settings),
            Ok(Err(_)) => {
                warn!("settings fetch superseded by a newer request");
                None
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "settings fetch timed out");
                None
            }
        };

        // Unconditional cleanup; a no-op when the dispatcher already took
        // the slot or a newer request replaced it.
        self.pending.lock().await.clear_settings_if(seq);
        out
    }

    /// Send the local wall clock to the device and wait (bounded) for the
    /// acknowledgement. Marks the sync in the cache only on success.
    async fn sync_time_once(&self) -> bool {
        let now = self.now_local();
        let payload = TimeSetPayload {
            year: now.year(),
            month: now.month() as u8,
            day: now.day(),
            hour: now.hour(),
            minute: now.minute(),
            second: now.second(),
        };

        let (tx, rx) = oneshot::channel();
        let seq = self.pending.lock().await.install_time_sync(tx);

        info!(
            device = %self.cfg.device.id,
            time = %format!("{:02}:{:02} {:02}.{:02}.{}", payload.hour, payload.minute, payload.day, payload.month, payload.year),
            "sending time to device"
        );
        self.link.send_time(&self.cfg.device.id, &payload).await;

        let timeout = Duration::from_secs(self.cfg.time_sync.ack_timeout_secs);
        let acked = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));

        self.pending.lock().await.clear_time_sync_if(seq);

        if acked {
            self.cache
                .mark_sync_completed(&self.cfg.device.id, self.now_local().unix_timestamp())
                .await;
            info!(device = %self.cfg.device.id, "time sync completed");
        } else {
            warn!(
                device = %self.cfg.device.id,
                waited_secs = timeout.as_secs(),
                "device did not confirm time sync — will retry next interval"
            );
        }
        acked
    }

    // ----------------------------
    // Background loops
    // ----------------------------
    //
    // Shared failure policy: an error inside one iteration is logged and
    // the loop continues to its next scheduled tick.

    pub async fn weather_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.weather.refresh_interval_secs);
        info!(interval_secs = interval.as_secs(), "weather refresh loop started");
        loop {
            if let Err(e) = self.weather_iteration().await {
                error!("weather refresh iteration failed: {e}");
            }
            if sleep_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
        info!("weather refresh loop stopped");
    }

    async fn weather_iteration(&self) -> anyhow::Result<()> {
        let today = self.today_label();
        let calls = self.cache.calls_today(&today).await;
        let cached = self.cache.snapshot().await;
        let now_ts = self.now_local().unix_timestamp();

        if refresh_decision(cached.as_ref(), calls, self.cfg.weather.daily_call_budget, now_ts) {
            // The fetch has its own bounded timeout, so a slow upstream
            // delays only this iteration, never the other loops.
            if let Some(fc) = self
                .forecast
                .fetch(self.cfg.weather.lat, self.cfg.weather.lon)
                .await
            {
                let snap = WeatherSnapshot {
                    current_temp: fc.current_temp,
                    current_feels_like: fc.current_feels_like,
                    current_condition: fc.current_condition.clone(),
                    humidity: fc.current_humidity,
                    wind_speed: fc.current_wind,
                    // The morning slot shows tomorrow's daytime forecast;
                    // the day slot shows the current reading.
                    morning_temp: fc.tomorrow_temp,
                    day_temp: Some(fc.current_temp),
                    evening_temp: fc.evening_temp,
                    night_temp: fc.night_temp,
                    fetched_at: now_ts,
                    expires_at: now_ts + 3600,
                    api_calls_today: calls + 1,
                };
                self.cache.store_snapshot(&snap, &today).await;
                info!(temp = snap.current_temp, "weather cache refreshed");
            }
        }

        // Cache fresh or not, the device gets the current snapshot...
        self.push_cached_weather().await;

        // ...and the store gets an outdoor row from the just-read cache.
        if let Some(snap) = self.cache.snapshot().await {
            self.store
                .append_weather_reading(
                    snap.current_temp as f64,
                    snap.humidity as f64,
                    self.now_local().unix_timestamp(),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("device monitoring started");
        let interval = Duration::from_secs(self.cfg.session.heartbeat_interval_secs);
        loop {
            self.heartbeat_tick().await;
            if sleep_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
        info!("device monitoring stopped");
    }

    async fn heartbeat_tick(&self) {
        let now = self.now_local();
        let mut s = self.session.write().await;
        let (old, new) = s.recompute_status(now);

        if new == DeviceStatus::Dead {
            if let Some(t) = &s.current_telemetry {
                let minutes = ((now - t.timestamp).whole_seconds() / 60).max(0);
                error!(minutes, "device is dead — no telemetry for {minutes} minutes");
            }
        } else if new == DeviceStatus::Online && old != DeviceStatus::Online {
            info!(device = %s.device_id, "device back online");
        }
    }

    pub async fn time_sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.time_sync.interval_secs);
        if sleep_or_shutdown(
            Duration::from_secs(self.cfg.time_sync.initial_delay_secs),
            &mut shutdown,
        )
        .await
        {
            return;
        }
        info!(interval_secs = interval.as_secs(), "time sync loop started");

        loop {
            let status = self.status().await;
            if status != DeviceStatus::Online {
                warn!(%status, "skipping time sync: device not reachable");
            } else if !self
                .cache
                .should_sync_time(
                    &self.cfg.device.id,
                    self.cfg.time_sync.min_days_between_syncs,
                    self.now_local().unix_timestamp(),
                )
                .await
            {
                info!(device = %self.cfg.device.id, "time sync not due");
            } else {
                // The ack wait is a cancellation point: shutdown during the
                // exchange exits without marking anything.
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("time sync loop cancelled");
                        return;
                    }
                    _ = self.sync_time_once() => {}
                }
            }

            if sleep_or_shutdown(interval, &mut shutdown).await {
                break;
            }
        }
        info!("time sync loop stopped");
    }

    // ----------------------------
    // Reporting accessors
    // ----------------------------

    /// Natural-language report over yesterday's local calendar day. No rows
    /// for the day means no report — the generator is never invoked.
    pub async fn daily_report(&self) -> Option<String> {
        let yesterday = self.now_local().date().previous_day()?;
        let (start, end) = self.day_bounds(yesterday);

        let stats = match self
            .store
            .stats_for_calendar_day(start, end, Some(&self.cfg.device.id))
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!("no statistics for yesterday — skipping daily report");
                return None;
            }
            Err(e) => {
                error!("daily stats query failed: {e}");
                return None;
            }
        };

        let records = match self
            .store
            .records_for_range(start, end, Some(&self.cfg.device.id), 50)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("daily records query failed: {e}");
                Vec::new()
            }
        };

        let date = date_label(yesterday);
        info!(%date, "requesting daily report");
        let prompt = report::daily_prompt(&date, &stats, &records, self.offset);
        self.reporter.generate(&prompt).await
    }

    /// Report over the 7 completed local days ending yesterday.
    pub async fn weekly_report(&self) -> Option<String> {
        let today = self.now_local().date();
        let days: Vec<(i64, i64, String)> = (1..=7)
            .rev()
            .map(|i| {
                let d = today - time::Duration::days(i);
                let (start, end) = self.day_bounds(d);
                (start, end, date_label(d))
            })
            .collect();

        let stats = match self
            .store
            .stats_for_calendar_week(&days, Some(&self.cfg.device.id))
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!("no statistics for the last week — skipping weekly report");
                return None;
            }
            Err(e) => {
                error!("weekly stats query failed: {e}");
                return None;
            }
        };

        info!(start = %stats.period_start, end = %stats.period_end, "requesting weekly report");
        let prompt = report::weekly_prompt(&stats);
        self.reporter.generate(&prompt).await
    }

    // ----------------------------
    // HTTP accessors
    // ----------------------------

    pub async fn status(&self) -> DeviceStatus {
        self.session.read().await.status
    }

    pub async fn current_telemetry(&self) -> Option<TelemetrySample> {
        self.session.read().await.current_telemetry.clone()
    }

    pub async fn weather(&self) -> Option<WeatherSnapshot> {
        self.cache.snapshot().await
    }

    pub async fn history(&self, hours: i64, max_points: usize) -> anyhow::Result<Vec<SeriesPoint>> {
        self.store
            .query_window(
                self.now_local().unix_timestamp(),
                hours,
                Some(&self.cfg.device.id),
                max_points,
            )
            .await
    }

    pub async fn stats(&self, hours: i64) -> anyhow::Result<StatsSummary> {
        self.store
            .stats_for_window(
                self.now_local().unix_timestamp(),
                hours,
                Some(&self.cfg.device.id),
            )
            .await
    }

    pub async fn verify_access_key(&self, key: &str) -> Option<i64> {
        self.cache.validate_key(key).await
    }

    /// Startup retention pass.
    pub async fn purge_retention(&self) {
        let now = self.now_local().unix_timestamp();
        match self.store.purge_older_than(now, self.cfg.retention.days).await {
            Ok(deleted) if deleted > 0 => {
                info!(deleted, days = self.cfg.retention.days, "old readings purged")
            }
            Ok(_) => {}
            Err(e) => error!("retention purge failed: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    // -- recording link -----------------------------------------------------

    #[derive(Default)]
    struct RecordingLink {
        weather: AtomicUsize,
        settings_pushes: AtomicUsize,
        settings_requests: AtomicUsize,
        time: AtomicUsize,
    }

    impl RecordingLink {
        fn total(&self) -> usize {
            self.weather.load(Ordering::SeqCst)
                + self.settings_pushes.load(Ordering::SeqCst)
                + self.settings_requests.load(Ordering::SeqCst)
                + self.time.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceLink for RecordingLink {
        async fn send_weather(&self, _device_id: &str, _weather: &WeatherForDevice) -> bool {
            self.weather.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn push_settings(&self, _device_id: &str, _settings: &DeviceSettings) -> bool {
            self.settings_pushes.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn request_settings(&self, _device_id: &str) -> bool {
            self.settings_requests.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn send_time(&self, _device_id: &str, _time: &TimeSetPayload) -> bool {
            self.time.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    // -- fixtures ------------------------------------------------------------

    async fn orch() -> (Arc<Orchestrator>, Arc<RecordingLink>) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let cache = WeatherCache::new(store.pool().clone());
        let link = Arc::new(RecordingLink::default());

        // Port 9 (discard) — these clients must never be reached in tests.
        let forecast = ForecastClient::new("http://127.0.0.1:9/forecast", "test-key").unwrap();
        let reporter = ReportClient::new("http://127.0.0.1:9", "test-key", "test-model").unwrap();

        let mut cfg = Config::default();
        cfg.session.settings_timeout_secs = 1;
        cfg.time_sync.ack_timeout_secs = 1;

        let shared_link: Arc<dyn DeviceLink> = link.clone();
        let o = Arc::new(Orchestrator::new(
            cfg,
            store.clone(),
            cache,
            shared_link,
            forecast,
            reporter,
        ));
        (o, link)
    }

    fn telemetry_event(temp: f64) -> InboundEvent {
        InboundEvent::Telemetry {
            device_id: "greenhouse_01".to_string(),
            msg: TelemetryMsg {
                temperature: temp,
                humidity: 50.0,
                free_memory: Some(20_000),
                uptime: Some(600),
                bluetooth_is_active: Some(false),
            },
        }
    }

    fn snapshot(expires_in: i64, now: i64) -> WeatherSnapshot {
        WeatherSnapshot {
            current_temp: 5,
            current_feels_like: 2,
            current_condition: "cloudy".into(),
            humidity: 80,
            wind_speed: 2.5,
            morning_temp: Some(6),
            day_temp: Some(5),
            evening_temp: Some(4),
            night_temp: Some(1),
            fetched_at: now,
            expires_at: now + expires_in,
            api_calls_today: 1,
        }
    }

    // -- telemetry handling ---------------------------------------------------

    #[tokio::test]
    async fn telemetry_updates_session_and_status() {
        let (o, _link) = orch().await;
        assert_eq!(o.status().await, DeviceStatus::NeverConnected);
        assert!(o.current_telemetry().await.is_none());

        o.dispatch(telemetry_event(21.5)).await;

        assert_eq!(o.status().await, DeviceStatus::Online);
        let t = o.current_telemetry().await.expect("telemetry stored");
        assert_eq!(t.temperature, 21.5);
        assert_eq!(t.free_memory, Some(20_000));
    }

    #[tokio::test]
    async fn exactly_one_row_persisted_per_five_samples() {
        let (o, _link) = orch().await;
        for i in 0..5 {
            o.dispatch(telemetry_event(20.0 + i as f64)).await;
        }

        let rows = o.history(24, 1000).await.unwrap();
        assert_eq!(rows.len(), 1);
        // The row holds the 5th sample's values.
        assert_eq!(rows[0].temp_in, Some(24.0));
        // And the latest sample is the 5th.
        assert_eq!(o.current_telemetry().await.unwrap().temperature, 24.0);
    }

    #[tokio::test]
    async fn persist_counter_wraps_across_batches() {
        let (o, _link) = orch().await;
        for _ in 0..12 {
            o.dispatch(telemetry_event(20.0)).await;
        }
        let rows = o.history(24, 1000).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn four_samples_persist_nothing() {
        let (o, _link) = orch().await;
        for _ in 0..4 {
            o.dispatch(telemetry_event(20.0)).await;
        }
        let rows = o.history(24, 1000).await.unwrap();
        assert!(rows.is_empty());
    }

    // -- reachability guard ----------------------------------------------------

    #[tokio::test]
    async fn all_outbound_paths_are_noops_when_never_connected() {
        let (o, link) = orch().await;

        o.push_cached_weather().await;
        o.push_settings(&DeviceSettings::default()).await;
        let settings = o.fetch_settings().await;

        assert!(settings.is_none());
        assert_eq!(link.total(), 0, "no publish may happen while unreachable");
    }

    #[tokio::test]
    async fn offline_settings_fetch_short_circuits_without_waiting() {
        let (o, link) = orch().await;
        let started = std::time::Instant::now();
        assert!(o.fetch_settings().await.is_none());
        // Guard path answers immediately, far below the 1 s timeout.
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(link.settings_requests.load(Ordering::SeqCst), 0);
    }

    // -- settings exchange -------------------------------------------------------

    #[tokio::test]
    async fn settings_fetch_times_out_to_absence() {
        let (o, link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await; // go online

        assert!(o.fetch_settings().await.is_none());
        assert_eq!(link.settings_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_settings_response_after_timeout_is_discarded() {
        let (o, link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        assert!(o.fetch_settings().await.is_none());

        // Late response: must not crash, must not resolve anything.
        o.dispatch(InboundEvent::SettingsUpdate {
            device_id: "greenhouse_01".into(),
            settings: DeviceSettings::default(),
        })
        .await;

        assert_eq!(link.settings_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settings_fetch_resolves_on_matching_response() {
        let (o, _link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        let o2 = o.clone();
        let fetch = tokio::spawn(async move { o2.fetch_settings().await });
        // Let the fetch install its pending slot and publish the request.
        tokio::task::yield_now().await;

        let mut settings = DeviceSettings::default();
        settings.display_mode = 2;
        o.dispatch(InboundEvent::SettingsUpdate {
            device_id: "greenhouse_01".into(),
            settings,
        })
        .await;

        let got = fetch.await.unwrap().expect("settings resolved");
        assert_eq!(got.display_mode, 2);
    }

    #[tokio::test]
    async fn settings_response_from_wrong_device_is_rejected() {
        let (o, _link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        let o2 = o.clone();
        let fetch = tokio::spawn(async move { o2.fetch_settings().await });
        tokio::task::yield_now().await;

        o.dispatch(InboundEvent::SettingsUpdate {
            device_id: "someone_else".into(),
            settings: DeviceSettings::default(),
        })
        .await;

        // Cross-talk never resolves the exchange; it times out to absence.
        assert!(fetch.await.unwrap().is_none());
    }

    // -- time sync exchange -------------------------------------------------------

    #[tokio::test]
    async fn time_sync_ack_marks_cache() {
        let (o, link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        let now = o.now_local().unix_timestamp();
        assert!(o.cache.should_sync_time("greenhouse_01", 2, now).await);

        let o2 = o.clone();
        let sync = tokio::spawn(async move { o2.sync_time_once().await });
        tokio::task::yield_now().await;

        o.dispatch(InboundEvent::TimeReady {
            device_id: "greenhouse_01".into(),
        })
        .await;

        assert!(sync.await.unwrap());
        assert_eq!(link.time.load(Ordering::SeqCst), 1);
        assert!(!o.cache.should_sync_time("greenhouse_01", 2, now).await);
    }

    #[tokio::test]
    async fn time_sync_timeout_leaves_cache_unmarked() {
        let (o, link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        assert!(!o.sync_time_once().await);
        assert_eq!(link.time.load(Ordering::SeqCst), 1);

        let now = o.now_local().unix_timestamp();
        assert!(o.cache.should_sync_time("greenhouse_01", 2, now).await);
    }

    // -- weather request -----------------------------------------------------------

    #[tokio::test]
    async fn weather_request_pushes_cached_snapshot() {
        let (o, link) = orch().await;
        let now = o.now_local().unix_timestamp();
        o.cache.store_snapshot(&snapshot(3600, now), "2023-11-14").await;

        o.dispatch(InboundEvent::WeatherRequest {
            device_id: "greenhouse_01".into(),
        })
        .await;

        // The request itself made the device Online, so the push went out.
        assert_eq!(link.weather.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn weather_request_with_empty_cache_sends_nothing() {
        let (o, link) = orch().await;
        o.dispatch(InboundEvent::WeatherRequest {
            device_id: "greenhouse_01".into(),
        })
        .await;
        assert_eq!(link.weather.load(Ordering::SeqCst), 0);
    }

    // -- refresh decision -----------------------------------------------------------

    #[test]
    fn refresh_needed_without_cache() {
        assert!(refresh_decision(None, 0, 28, 1_700_000_000));
    }

    #[test]
    fn refresh_skipped_while_cache_fresh_even_at_budget() {
        let now = 1_700_000_000;
        let snap = snapshot(3600, now);
        assert!(!refresh_decision(Some(&snap), 28, 28, now));
    }

    #[test]
    fn refresh_happens_when_expired_and_budget_left() {
        let now = 1_700_000_000;
        let snap = snapshot(-1, now);
        assert!(refresh_decision(Some(&snap), 27, 28, now));
    }

    #[test]
    fn refresh_skipped_when_expired_but_budget_spent() {
        let now = 1_700_000_000;
        let snap = snapshot(-1, now);
        assert!(!refresh_decision(Some(&snap), 28, 28, now));
    }

    // -- weather iteration ------------------------------------------------------------

    #[tokio::test]
    async fn weather_iteration_reuses_fresh_cache_and_appends_row() {
        let (o, link) = orch().await;
        let now = o.now_local().unix_timestamp();
        o.cache.store_snapshot(&snapshot(3600, now), &o.today_label()).await;

        // Device unreachable: push skipped, but the outdoor row still lands.
        o.weather_iteration().await.unwrap();

        assert_eq!(link.weather.load(Ordering::SeqCst), 0);
        let rows = o.history(24, 1000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temp_out, Some(5.0));
        assert_eq!(rows[0].hum_out, Some(80.0));
    }

    #[tokio::test]
    async fn weather_iteration_pushes_to_online_device() {
        let (o, link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;
        let now = o.now_local().unix_timestamp();
        o.cache.store_snapshot(&snapshot(3600, now), &o.today_label()).await;

        o.weather_iteration().await.unwrap();

        assert_eq!(link.weather.load(Ordering::SeqCst), 1);
    }

    // -- heartbeat ----------------------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_marks_silent_device_dead() {
        let (o, _link) = orch().await;
        o.dispatch(telemetry_event(20.0)).await;

        {
            let mut s = o.session.write().await;
            s.last_activity = Some(o.now_local() - time::Duration::seconds(400));
        }
        o.heartbeat_tick().await;
        assert_eq!(o.status().await, DeviceStatus::Dead);

        // Any new message revives it.
        o.dispatch(telemetry_event(20.0)).await;
        assert_eq!(o.status().await, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn heartbeat_leaves_never_connected_alone() {
        let (o, _link) = orch().await;
        o.heartbeat_tick().await;
        assert_eq!(o.status().await, DeviceStatus::NeverConnected);
    }

    // -- reports ---------------------------------------------------------------------------

    #[tokio::test]
    async fn daily_report_absent_without_stats() {
        let (o, _link) = orch().await;
        // Empty store: the accessor answers before touching the generator.
        assert!(o.daily_report().await.is_none());
    }

    #[tokio::test]
    async fn weekly_report_absent_without_stats() {
        let (o, _link) = orch().await;
        assert!(o.weekly_report().await.is_none());
    }

    // -- payload mapping --------------------------------------------------------------------

    #[test]
    fn weather_for_device_fills_missing_parts_with_current_temp() {
        let mut snap = snapshot(3600, 1_700_000_000);
        snap.morning_temp = None;
        snap.night_temp = None;
        let w = weather_for_device(&snap, UtcOffset::UTC);
        assert_eq!(w.morning_temp, 5);
        assert_eq!(w.night_temp, 5);
        assert_eq!(w.day_temp, 5);
        assert_eq!(w.evening_temp, 4);
    }

    #[test]
    fn weather_for_device_formats_update_time() {
        let snap = snapshot(3600, 1_700_000_000); // 22:13:20 UTC
        let w = weather_for_device(&snap, UtcOffset::UTC);
        assert_eq!(w.update_at, "22:13");
    }

    #[test]
    fn date_label_formats_iso_date() {
        let d = Date::from_calendar_date(2023, time::Month::November, 3).unwrap();
        assert_eq!(date_label(d), "2023-11-03");
    }
}
