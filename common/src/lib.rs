pub mod classifier;
pub mod config;
pub mod heat_index;
pub mod influx;
pub mod model;
pub mod network;
pub mod station;
pub mod telemetry;
pub mod types;

pub use classifier::{argmax_first, classify};
pub use config::{AccessPointCredentials, InfluxConfig, StationConfig};
pub use model::{init_engine, InferenceEngine, InferenceError, Interpreter, EMBEDDED_MODEL};
pub use network::{select_access_point, Network, ScannedAccessPoint};
pub use station::{
    wake, AssociationTimeout, CycleReport, Delay, SensorReader, Station, StationError, StationPhase,
    WakeOutcome,
};
pub use telemetry::{FieldValue, TelemetryBackend, TelemetryError, TelemetryPoint};
pub use types::{Classification, SensorSample, WeatherCondition};
