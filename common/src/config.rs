use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE_ID: &str = "ESP32";
pub const MEASUREMENT_NAME: &str = "weather_sensor";
pub const TENSOR_ARENA_BYTES: usize = 12 * 1024;
pub const CONNECTION_ATTEMPT_THRESHOLD: u32 = 100;
pub const SLEEP_DURATION_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPointCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub access_points: Vec<AccessPointCredentials>,
    pub ntp_servers: Vec<String>,
    /// POSIX TZ string handed to the C library after SNTP sync.
    pub posix_tz: String,
    /// IANA zone used to render local time in diagnostics. Must describe the
    /// same offset as `posix_tz`; empty disables the local-time log line.
    pub timezone: String,
    pub connect_poll_interval_ms: u64,
    pub connect_attempt_threshold: u32,
    pub clock_sync_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            access_points: Vec::new(),
            ntp_servers: vec!["pool.ntp.org".to_string(), "time.nis.gov".to_string()],
            posix_tz: "ICT-7".to_string(),
            timezone: "Asia/Bangkok".to_string(),
            connect_poll_interval_ms: 100,
            connect_attempt_threshold: CONNECTION_ATTEMPT_THRESHOLD,
            clock_sync_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub measurement: String,
    pub device: String,
    pub request_timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            measurement: MEASUREMENT_NAME.to_string(),
            device: DEFAULT_DEVICE_ID.to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub sleep_secs: u64,
    pub post_boot_delay_ms: u64,
    pub step_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sleep_secs: SLEEP_DURATION_SECS,
            post_boot_delay_ms: 3_000,
            step_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub arena_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arena_bytes: TENSOR_ARENA_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    pub network: NetworkConfig,
    pub influx: InfluxConfig,
    pub timing: TimingConfig,
    pub model: ModelConfig,
}

impl StationConfig {
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ssid) = lookup("WIFI_SSID").filter(|value| !value.trim().is_empty()) {
            let password = lookup("WIFI_PASS").unwrap_or_default();
            let ap = AccessPointCredentials { ssid, password };
            if !self.network.access_points.contains(&ap) {
                self.network.access_points.insert(0, ap);
            }
        }

        if let Some(url) = lookup("INFLUXDB_URL") {
            self.influx.url = url.trim_end_matches('/').to_string();
        }
        if let Some(token) = lookup("INFLUXDB_TOKEN") {
            self.influx.token = token;
        }
        if let Some(org) = lookup("INFLUXDB_ORG") {
            self.influx.org = org;
        }
        if let Some(bucket) = lookup("INFLUXDB_BUCKET") {
            self.influx.bucket = bucket;
        }
        if let Some(device) = lookup("DEVICE_ID").filter(|value| !value.is_empty()) {
            self.influx.device = device;
        }
        let timezone = lookup("TIMEZONE").filter(|value| !value.is_empty());
        if let Some(tz) = lookup("TZ_INFO").filter(|value| !value.is_empty()) {
            if tz != self.network.posix_tz && timezone.is_none() {
                self.network.timezone.clear();
            }
            self.network.posix_tz = tz;
        }
        if let Some(timezone) = timezone {
            self.network.timezone = timezone;
        }
        if let Some(secs) = lookup("SLEEP_SECS").and_then(|value| value.parse::<u64>().ok()) {
            self.timing.sleep_secs = secs;
        }

        self.sanitize();
    }

    pub fn sanitize(&mut self) {
        self.network.connect_attempt_threshold = self.network.connect_attempt_threshold.max(1);
        self.timing.sleep_secs = self.timing.sleep_secs.max(1);
        self.model.arena_bytes = self.model.arena_bytes.max(1024);
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.timing.sleep_secs)
    }

    pub fn has_backend(&self) -> bool {
        !self.influx.url.trim().is_empty()
    }
}
