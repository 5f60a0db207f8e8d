use std::fmt::Write as _;

use thiserror::Error;

use crate::{
    config::InfluxConfig,
    types::{Classification, SensorSample},
};

pub const FIELD_TEMPERATURE: &str = "Temperature (C)";
pub const FIELD_HUMIDITY: &str = "Humidity";
pub const FIELD_WEATHER_CONDITION: &str = "Weather Condition";
pub const FIELD_HEAT_INDEX: &str = "Heat Index";
pub const FIELD_INDEX_NUMBERS: &str = "Index Numbers";
pub const TAG_DEVICE: &str = "device";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("backend not reachable: {0}")]
    Connection(String),
    #[error("write rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f32),
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPoint {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    /// Unix seconds; `None` lets the server stamp the write.
    pub timestamp: Option<i64>,
}

impl TelemetryPoint {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: None,
        }
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: FieldValue) -> &mut Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn from_reading(
        influx: &InfluxConfig,
        sample: &SensorSample,
        classification: &Classification,
        timestamp: Option<i64>,
    ) -> Self {
        let mut point = Self::new(influx.measurement.as_str());
        point
            .add_tag(TAG_DEVICE, influx.device.as_str())
            .add_field(FIELD_TEMPERATURE, FieldValue::Float(sample.temperature_c))
            .add_field(FIELD_HUMIDITY, FieldValue::Float(sample.humidity))
            .add_field(
                FIELD_WEATHER_CONDITION,
                FieldValue::String(classification.label().to_string()),
            )
            .add_field(FIELD_HEAT_INDEX, FieldValue::Float(sample.heat_index_c))
            .add_field(
                FIELD_INDEX_NUMBERS,
                FieldValue::Integer(classification.label_index() as i64),
            );
        point.timestamp = timestamp;
        point
    }

    // Non-finite floats have no line protocol form and are skipped.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let mut separator = ' ';
        for (key, value) in &self.fields {
            let encoded = match value {
                FieldValue::Float(v) if !v.is_finite() => continue,
                FieldValue::Float(v) => format!("{v}"),
                FieldValue::Integer(v) => format!("{v}i"),
                FieldValue::String(v) => format!("\"{}\"", escape(v, &['"', '\\'])),
            };
            let _ = write!(line, "{separator}{}={encoded}", escape(key, &[',', '=', ' ']));
            separator = ',';
        }

        if let Some(ts) = self.timestamp {
            let _ = write!(line, " {ts}");
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub trait TelemetryBackend {
    fn server_url(&self) -> &str;

    fn validate_connection(&mut self) -> Result<(), TelemetryError>;

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), TelemetryError>;
}
