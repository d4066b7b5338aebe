use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

// ---------------------------------------------------------------------------
// Device status
// ---------------------------------------------------------------------------

/// Inferred liveness of the device, derived purely from how recently it was
/// heard from. Any inbound message counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    NeverConnected,
    Online,
    Offline,
    Dead,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::NeverConnected => "never_connected",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Telemetry sample
// ---------------------------------------------------------------------------

/// Latest decoded telemetry message. Ephemeral; every 5th sample is also
/// written to the time-series store by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub free_memory: Option<i64>,
    pub uptime: Option<i64>,
    pub bluetooth_is_active: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Device session
// ---------------------------------------------------------------------------

/// In-memory session for the single device this deployment talks to.
/// Created at process start, never persisted; rebuilt from scratch on
/// restart while history survives in the store.
pub struct DeviceSession {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_activity: Option<OffsetDateTime>,
    pub current_telemetry: Option<TelemetrySample>,
    pub persist_counter: u8,

    online_threshold_secs: f64,
    dead_threshold_secs: f64,
}

impl DeviceSession {
    pub fn new(device_id: &str, online_threshold_secs: u64, dead_threshold_secs: u64) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: DeviceStatus::NeverConnected,
            last_activity: None,
            current_telemetry: None,
            persist_counter: 0,
            online_threshold_secs: online_threshold_secs as f64,
            dead_threshold_secs: dead_threshold_secs as f64,
        }
    }

    /// Derive the status from elapsed time since the last inbound message.
    /// elapsed < online threshold → Online; < dead threshold → Offline;
    /// otherwise Dead. No activity ever → NeverConnected.
    fn derive_status(&self, now: OffsetDateTime) -> DeviceStatus {
        match self.last_activity {
            None => DeviceStatus::NeverConnected,
            Some(last) => {
                let elapsed = (now - last).as_seconds_f64();
                if elapsed < self.online_threshold_secs {
                    DeviceStatus::Online
                } else if elapsed < self.dead_threshold_secs {
                    DeviceStatus::Offline
                } else {
                    DeviceStatus::Dead
                }
            }
        }
    }

    /// Recompute and store the status; logs any transition. Returns
    /// (old, new) so callers can react to specific edges.
    pub fn recompute_status(&mut self, now: OffsetDateTime) -> (DeviceStatus, DeviceStatus) {
        let old = self.status;
        let new = self.derive_status(now);
        if new != old {
            info!(device = %self.device_id, from = %old, to = %new, "device status changed");
            self.status = new;
        }
        (old, new)
    }

    /// Record that any message arrived from the device, then recompute.
    /// This is the single chokepoint making "any message ⇒ alive" hold.
    pub fn record_activity(&mut self, now: OffsetDateTime) {
        self.last_activity = Some(now);
        self.recompute_status(now);
    }

    /// Commands may only be sent while the device is Online.
    pub fn can_send(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    /// Bump the telemetry persistence counter; returns true when this
    /// sample is the 5th and must be written to the store. Wraps to 0.
    pub fn bump_persist_counter(&mut self, every: u8) -> bool {
        self.persist_counter += 1;
        if self.persist_counter >= every {
            self.persist_counter = 0;
            true
        } else {
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
