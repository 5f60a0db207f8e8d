use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    classifier::classify,
    config::{ModelConfig, StationConfig},
    model::{InferenceEngine, InferenceError},
    network::{now_in_timezone, Network},
    telemetry::{TelemetryBackend, TelemetryError, TelemetryPoint},
    types::{Classification, SensorSample},
};

pub trait SensorReader {
    // A failed read yields NaN fields.
    fn read_sample(&mut self) -> SensorSample;
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationPhase {
    Init,
    Sampling,
    Inferring,
    Publishing,
    Sleeping,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wifi not associated after {attempts} attempts")]
pub struct AssociationTimeout {
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("model provided is schema version {model} not equal to supported version {supported}")]
    ModelVersionMismatch { model: u32, supported: u32 },
    #[error("tensor allocation failed: {0}")]
    TensorAllocationFailure(#[source] InferenceError),
    #[error("model rejected: {0}")]
    InvalidModel(#[source] InferenceError),
    #[error("inference failed: {0}")]
    InferenceFailure(#[source] InferenceError),
    #[error(transparent)]
    WifiConnectionTimeout(#[from] AssociationTimeout),
    #[error("InfluxDB connection failed: {0}")]
    DatabaseConnectionFailure(#[source] TelemetryError),
    #[error("InfluxDB write failed: {0}")]
    DatabaseWriteFailure(#[source] TelemetryError),
}

impl StationError {
    fn from_engine_init(err: InferenceError) -> Self {
        match err {
            InferenceError::VersionMismatch { model, supported } => {
                Self::ModelVersionMismatch { model, supported }
            }
            err @ (InferenceError::AllocationFailed { .. } | InferenceError::NotAllocated) => {
                Self::TensorAllocationFailure(err)
            }
            err => Self::InvalidModel(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationContext {
    pub phase: StationPhase,
    pub sample: Option<SensorSample>,
    pub classification: Option<Classification>,
    pub clock_synced: bool,
    pub backend_reachable: bool,
}

impl Default for StationContext {
    fn default() -> Self {
        Self {
            phase: StationPhase::Init,
            sample: None,
            classification: None,
            clock_synced: false,
            backend_reachable: false,
        }
    }
}

#[derive(Debug)]
pub struct CycleReport {
    pub sample: SensorSample,
    pub classification: Option<Classification>,
    pub point: Option<TelemetryPoint>,
    /// `None` when the cycle ended before the link was checked.
    pub wifi_connected: Option<bool>,
    pub error: Option<StationError>,
}

impl CycleReport {
    pub fn published(&self) -> bool {
        self.point.is_some() && self.error.is_none()
    }
}

#[derive(Debug)]
pub enum WakeOutcome {
    DeepSleep {
        duration: Duration,
        report: CycleReport,
    },
    Restart {
        attempts: u32,
    },
    Halt(StationError),
}

impl WakeOutcome {
    pub fn phase(&self) -> StationPhase {
        match self {
            Self::DeepSleep { .. } => StationPhase::Sleeping,
            Self::Restart { .. } => StationPhase::Init,
            Self::Halt(_) => StationPhase::Halted,
        }
    }
}

pub struct Station<S, E, N, B, D> {
    config: StationConfig,
    sensor: S,
    engine: E,
    network: N,
    backend: B,
    delay: D,
    context: StationContext,
}

impl<S, E, N, B, D> Station<S, E, N, B, D>
where
    S: SensorReader,
    E: InferenceEngine,
    N: Network,
    B: TelemetryBackend,
    D: Delay,
{
    pub fn new(config: StationConfig, sensor: S, engine: E, network: N, backend: B, delay: D) -> Self {
        Self {
            config,
            sensor,
            engine,
            network,
            backend,
            delay,
            context: StationContext::default(),
        }
    }

    pub fn context(&self) -> &StationContext {
        &self.context
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Polls association until the link is up. Hitting the attempt
    /// threshold is reported as a timeout; the caller restarts the device.
    pub fn connect(&mut self) -> Result<u32, AssociationTimeout> {
        let threshold = self.config.network.connect_attempt_threshold.max(1);
        let interval = self.config.network.connect_poll_interval_ms;
        let mut failed = 0_u32;

        info!("connecting to wifi");
        if !self.network.start_association() {
            warn!("wifi setup failed; polling until the attempt limit");
        }
        loop {
            if self.network.poll_association() {
                info!("wifi connected after {failed} failed poll(s)");
                return Ok(failed);
            }

            failed = failed.saturating_add(1);
            if failed >= threshold {
                return Err(AssociationTimeout { attempts: failed });
            }
            self.delay.delay_ms(interval);
        }
    }

    pub fn start(&mut self) -> Result<(), AssociationTimeout> {
        self.context.phase = StationPhase::Init;
        self.connect()?;

        let network = &self.config.network;
        self.context.clock_synced = self
            .network
            .sync_clock(&network.ntp_servers, &network.posix_tz);
        if self.context.clock_synced {
            match self
                .network
                .now()
                .and_then(|now| now_in_timezone(&network.timezone, now))
            {
                Some(local) => info!("clock synced, local time {}", local.to_rfc3339()),
                None => info!("clock synced"),
            }
        } else {
            warn!("clock sync did not complete; points will use server time");
        }

        if let Err(err) = self.validate_backend() {
            warn!("{err}");
        }

        self.delay.delay_ms(self.config.timing.post_boot_delay_ms);
        Ok(())
    }

    fn validate_backend(&mut self) -> Result<(), StationError> {
        match self.backend.validate_connection() {
            Ok(()) => {
                info!("connected to InfluxDB: {}", self.backend.server_url());
                self.context.backend_reachable = true;
                Ok(())
            }
            Err(err) => {
                self.context.backend_reachable = false;
                Err(StationError::DatabaseConnectionFailure(err))
            }
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let step = self.config.timing.step_delay_ms;
        self.delay.delay_ms(step);

        self.context.phase = StationPhase::Sampling;
        let sample = self.sensor.read_sample();
        self.context.sample = Some(sample);
        if !sample.is_valid() {
            warn!(
                "sensor reading invalid (temp={}, humidity={})",
                sample.temperature_c, sample.humidity
            );
        }

        self.context.phase = StationPhase::Inferring;
        let classification = match classify(&mut self.engine, &sample) {
            Ok(classification) => classification,
            Err(err) => {
                error!("Invoke failed: {err}; skipping publish this cycle");
                self.context.classification = None;
                self.context.phase = StationPhase::Sleeping;
                return CycleReport {
                    sample,
                    classification: None,
                    point: None,
                    wifi_connected: None,
                    error: Some(StationError::InferenceFailure(err)),
                };
            }
        };
        self.context.classification = Some(classification);

        info!(
            "Humidity: {:.2} %, Temp: {:.2} Celsius, Heat index: {:.2} Celsius",
            sample.humidity, sample.temperature_c, sample.heat_index_c
        );
        info!(
            "Weather Condition: {} Index Numbers: {}",
            classification.label(),
            classification.label_index()
        );
        debug!("winning score {}", classification.score);

        self.delay.delay_ms(step);

        self.context.phase = StationPhase::Publishing;
        let wifi_connected = self.network.poll_association();
        if !wifi_connected {
            warn!("Wifi connection lost");
        }

        let timestamp = if self.context.clock_synced {
            self.network.now().map(|now| now.timestamp())
        } else {
            None
        };
        let point =
            TelemetryPoint::from_reading(&self.config.influx, &sample, &classification, timestamp);
        info!("Writing: {}", point.to_line_protocol());

        let error = match self.backend.write_point(&point) {
            Ok(()) => None,
            Err(err) => {
                warn!("InfluxDB write failed: {err}");
                Some(StationError::DatabaseWriteFailure(err))
            }
        };

        self.delay.delay_ms(step);
        self.context.phase = StationPhase::Sleeping;
        info!("going to sleep for {}s", self.config.timing.sleep_secs);

        CycleReport {
            sample,
            classification: Some(classification),
            point: Some(point),
            wifi_connected: Some(wifi_connected),
            error,
        }
    }
}

pub fn wake<S, E, N, B, D, F>(
    config: StationConfig,
    sensor: S,
    load_engine: F,
    network: N,
    backend: B,
    delay: D,
) -> WakeOutcome
where
    S: SensorReader,
    E: InferenceEngine,
    N: Network,
    B: TelemetryBackend,
    D: Delay,
    F: FnOnce(&ModelConfig) -> Result<E, InferenceError>,
{
    let engine = match load_engine(&config.model) {
        Ok(engine) => engine,
        Err(err) => {
            let err = StationError::from_engine_init(err);
            error!("station halted during init: {err}");
            return WakeOutcome::Halt(err);
        }
    };

    let sleep = config.sleep_duration();
    let mut station = Station::new(config, sensor, engine, network, backend, delay);

    if let Err(AssociationTimeout { attempts }) = station.start() {
        error!("wifi association timed out after {attempts} attempts; restarting");
        return WakeOutcome::Restart { attempts };
    }

    let report = station.run_cycle();
    WakeOutcome::DeepSleep {
        duration: sleep,
        report,
    }
}
