use core::convert::TryInto;
use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use dht_sensor::dht22;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    io::EspIOError,
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use weather_common::{
    config::NetworkConfig,
    influx::{authorization_header, error_message, health_url, write_url, LINE_PROTOCOL_CONTENT_TYPE},
    init_engine, select_access_point, wake, AccessPointCredentials, Delay, InfluxConfig, Network,
    ScannedAccessPoint, SensorReader, SensorSample, StationConfig, TelemetryBackend,
    TelemetryError, TelemetryPoint, WakeOutcome, EMBEDDED_MODEL,
};

const DHT22_PIN: i32 = 32;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const SNTP_POLL_MS: u64 = 200;
const MAX_ERROR_BODY: usize = 1024;

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl SensorReader for Dht22Sensor {
    fn read_sample(&mut self) -> SensorSample {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return SensorSample::from_readings(f32::NAN, f32::NAN);
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                SensorSample::from_readings(reading.temperature, reading.relative_humidity)
            }
            Err(err) => {
                warn!("failed to read DHT22 on GPIO{DHT22_PIN}: {err:?}");
                SensorSample::from_readings(f32::NAN, f32::NAN)
            }
        }
    }
}

struct EspNetwork {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    access_points: Vec<AccessPointCredentials>,
    clock_sync_timeout: Duration,
    started: bool,
    connect_issued: bool,
    _sntp: Option<EspSntp<'static>>,
    clock_synced: bool,
}

impl EspNetwork {
    fn new(wifi: EspWifi<'static>, sys_loop: EspSystemEventLoop, network: &NetworkConfig) -> Self {
        Self {
            wifi,
            sys_loop,
            access_points: network.access_points.clone(),
            clock_sync_timeout: Duration::from_millis(network.clock_sync_timeout_ms),
            started: false,
            connect_issued: false,
            _sntp: None,
            clock_synced: false,
        }
    }

    fn configure(&mut self) -> anyhow::Result<()> {
        if self.access_points.is_empty() {
            return Err(anyhow!("no wifi access points configured"));
        }

        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;

        let scanned: Vec<ScannedAccessPoint> = match wifi.scan() {
            Ok(found) => found
                .into_iter()
                .map(|ap| ScannedAccessPoint {
                    ssid: ap.ssid.to_string(),
                    rssi: ap.signal_strength,
                })
                .collect(),
            Err(err) => {
                warn!("wifi scan failed: {err:?}");
                Vec::new()
            }
        };

        let chosen = select_access_point(&self.access_points, &scanned)
            .ok_or_else(|| anyhow!("no wifi access points configured"))?;
        let auth_method = if chosen.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: chosen
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: chosen
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        info!(
            "wifi started, connecting to `{}` ({} visible networks)",
            chosen.ssid,
            scanned.len()
        );
        Ok(())
    }
}

impl Network for EspNetwork {
    fn start_association(&mut self) -> bool {
        match self.configure() {
            Ok(()) => self.started = true,
            Err(err) => warn!("wifi setup failed: {err:#}"),
        }
        self.started
    }

    fn poll_association(&mut self) -> bool {
        if !self.started {
            return false;
        }

        let connected = self.wifi.is_connected().unwrap_or(false) && self.wifi.is_up().unwrap_or(false);
        if connected {
            self.connect_issued = false;
            return true;
        }

        if !self.connect_issued {
            match self.wifi.connect() {
                Ok(()) => self.connect_issued = true,
                Err(err) => warn!("wifi connect request failed: {err:?}"),
            }
        }
        false
    }

    fn sync_clock(&mut self, servers: &[String], posix_tz: &str) -> bool {
        std::env::set_var("TZ", posix_tz);
        unsafe { esp_idf_svc::sys::tzset() };

        let mut conf = SntpConf::default();
        for (slot, server) in conf.servers.iter_mut().zip(servers) {
            *slot = server.as_str();
        }

        let sntp = match EspSntp::new(&conf) {
            Ok(sntp) => sntp,
            Err(err) => {
                warn!("failed to start SNTP: {err:?}");
                return false;
            }
        };

        let started = Instant::now();
        while sntp.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= self.clock_sync_timeout {
                warn!(
                    "SNTP sync not completed after {}s",
                    self.clock_sync_timeout.as_secs()
                );
                self._sntp = Some(sntp);
                return false;
            }
            thread::sleep(Duration::from_millis(SNTP_POLL_MS));
        }

        self._sntp = Some(sntp);
        self.clock_synced = true;
        true
    }

    fn now(&self) -> Option<DateTime<Utc>> {
        self.clock_synced.then(Utc::now)
    }
}

struct EspInfluxBackend {
    server_url: String,
    write_url: String,
    health_url: String,
    authorization: String,
    timeout: Duration,
}

impl EspInfluxBackend {
    fn new(influx: &InfluxConfig) -> Self {
        Self {
            server_url: influx.url.clone(),
            write_url: write_url(influx),
            health_url: health_url(influx),
            authorization: authorization_header(influx),
            timeout: Duration::from_millis(influx.request_timeout_ms),
        }
    }

    fn client(&self) -> Result<HttpClient<EspHttpConnection>, TelemetryError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        EspHttpConnection::new(&http_conf)
            .map(HttpClient::wrap)
            .map_err(|err| TelemetryError::Transport(format!("{err:?}")))
    }
}

fn read_body<R: Read>(response: &mut R) -> Vec<u8> {
    let mut body = Vec::new();
    let mut chunk = [0_u8; 256];
    while body.len() < MAX_ERROR_BODY {
        match response.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => body.extend_from_slice(&chunk[..read]),
        }
    }
    body
}

impl TelemetryBackend for EspInfluxBackend {
    fn server_url(&self) -> &str {
        &self.server_url
    }

    fn validate_connection(&mut self) -> Result<(), TelemetryError> {
        let connection = |err: EspIOError| TelemetryError::Connection(format!("{err:?}"));

        let mut client = self.client()?;
        let request = client
            .request(Method::Get, &self.health_url, &[])
            .map_err(connection)?;
        let mut response = request.submit().map_err(connection)?;

        let status = response.status();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = read_body(&mut response);
        Err(TelemetryError::Connection(error_message(status, &body)))
    }

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), TelemetryError> {
        let transport = |err: EspIOError| TelemetryError::Transport(format!("{err:?}"));

        let body = point.to_line_protocol();
        let content_length = body.len().to_string();
        let headers = [
            ("Authorization", self.authorization.as_str()),
            ("Content-Type", LINE_PROTOCOL_CONTENT_TYPE),
            ("Content-Length", content_length.as_str()),
        ];

        let mut client = self.client()?;
        let mut request = client
            .request(Method::Post, &self.write_url, &headers)
            .map_err(transport)?;
        request.write_all(body.as_bytes()).map_err(transport)?;
        request.flush().map_err(transport)?;
        let mut response = request.submit().map_err(transport)?;

        let status = response.status();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = read_body(&mut response);
        Err(TelemetryError::Rejected {
            status,
            message: error_message(status, &body),
        })
    }
}

struct EspDelay;

impl Delay for EspDelay {
    fn delay_ms(&mut self, ms: u64) {
        FreeRtos::delay_ms(ms.try_into().unwrap_or(u32::MAX));
        feed_watchdog();
    }
}

/// Settings are baked in at build time; there is no persistent storage to
/// read them from after a deep sleep.
fn build_env(key: &str) -> Option<String> {
    let value = match key {
        "WIFI_SSID" => option_env!("WIFI_SSID"),
        "WIFI_PASS" => option_env!("WIFI_PASS"),
        "INFLUXDB_URL" => option_env!("INFLUXDB_URL"),
        "INFLUXDB_TOKEN" => option_env!("INFLUXDB_TOKEN"),
        "INFLUXDB_ORG" => option_env!("INFLUXDB_ORG"),
        "INFLUXDB_BUCKET" => option_env!("INFLUXDB_BUCKET"),
        "DEVICE_ID" => option_env!("DEVICE_ID"),
        "SLEEP_SECS" => option_env!("SLEEP_SECS"),
        "TZ_INFO" => option_env!("TZ_INFO"),
        "TIMEZONE" => option_env!("TIMEZONE"),
        _ => None,
    };
    value.map(str::to_string)
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = StationConfig::default();
    config.apply_overrides(build_env);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let sensor = Dht22Sensor::new(peripherals.pins.gpio32.downgrade())
        .context("failed to initialize DHT22")?;
    let esp_wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?;
    let network = EspNetwork::new(esp_wifi, sys_loop, &config.network);
    let backend = EspInfluxBackend::new(&config.influx);

    let outcome = wake(
        config,
        sensor,
        |model| init_engine(EMBEDDED_MODEL, model.arena_bytes),
        network,
        backend,
        EspDelay,
    );

    info!("wake finished in {:?} phase", outcome.phase());
    match outcome {
        WakeOutcome::DeepSleep { duration, report } => {
            if let Some(err) = report.error {
                warn!("cycle finished with error: {err}");
            }
            info!("going to sleep for {}s", duration.as_secs());
            enter_deep_sleep(duration)?;
        }
        WakeOutcome::Restart { attempts } => {
            warn!("wifi not associated after {attempts} attempts; restarting");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        WakeOutcome::Halt(err) => {
            error!("station halted: {err:#}");
            halt();
        }
    }

    Ok(())
}

fn enter_deep_sleep(duration: Duration) -> anyhow::Result<()> {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    let rc = unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("esp_sleep_enable_timer_wakeup failed with code {}", rc));
    }
    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() };
    Ok(())
}

fn halt() -> ! {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_delete(core::ptr::null_mut()) };
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
