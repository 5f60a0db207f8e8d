use std::{thread, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Timelike, Utc};
use tracing::{info, warn};

use weather_common::{
    influx::{authorization_header, error_message, health_url, write_url, LINE_PROTOCOL_CONTENT_TYPE},
    init_engine, wake, Delay, InfluxConfig, Network, SensorReader, SensorSample, StationConfig,
    TelemetryBackend, TelemetryError, TelemetryPoint, WakeOutcome, EMBEDDED_MODEL,
};

/// Stands in for the DHT22. Readings drift with the wall clock so successive
/// wakes do not all classify the same.
struct SimulatedDht;

impl SensorReader for SimulatedDht {
    fn read_sample(&mut self) -> SensorSample {
        // Hardware integration point: the device build reads a DHT22 on GPIO32.
        let minute = Utc::now().minute();
        let temperature_c = 18.0 + (minute % 15) as f32;
        let humidity = 35.0 + ((minute * 7) % 60) as f32;
        SensorSample::from_readings(temperature_c, humidity)
    }
}

/// The host is always on a network and its clock is kept by the OS.
struct HostNetwork;

impl Network for HostNetwork {
    fn poll_association(&mut self) -> bool {
        true
    }

    fn sync_clock(&mut self, _servers: &[String], _posix_tz: &str) -> bool {
        true
    }

    fn now(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }
}

struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

struct HttpInfluxBackend {
    agent: ureq::Agent,
    server_url: String,
    write_url: String,
    health_url: String,
    authorization: String,
}

impl HttpInfluxBackend {
    fn new(influx: &InfluxConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(influx.request_timeout_ms))
            .build();
        Self {
            agent,
            server_url: influx.url.clone(),
            write_url: write_url(influx),
            health_url: health_url(influx),
            authorization: authorization_header(influx),
        }
    }
}

impl TelemetryBackend for HttpInfluxBackend {
    fn server_url(&self) -> &str {
        &self.server_url
    }

    fn validate_connection(&mut self) -> Result<(), TelemetryError> {
        match self.agent.get(&self.health_url).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(TelemetryError::Connection(error_message(status, body.as_bytes())))
            }
            Err(err) => Err(TelemetryError::Connection(err.to_string())),
        }
    }

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), TelemetryError> {
        let result = self
            .agent
            .post(&self.write_url)
            .set("Authorization", &self.authorization)
            .set("Content-Type", LINE_PROTOCOL_CONTENT_TYPE)
            .send_string(&point.to_line_protocol());

        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(TelemetryError::Rejected {
                    status,
                    message: error_message(status, body.as_bytes()),
                })
            }
            Err(err) => Err(TelemetryError::Transport(err.to_string())),
        }
    }
}

fn load_config() -> StationConfig {
    let mut config = StationConfig::default();
    config.apply_overrides(|key| std::env::var(key).ok());
    config
}

/// Everything is rebuilt from scratch, the same as a device coming out of
/// deep sleep.
fn wake_once() -> WakeOutcome {
    let config = load_config();
    if !config.has_backend() {
        warn!("INFLUXDB_URL not set; writes will fail");
    }
    let backend = HttpInfluxBackend::new(&config.influx);

    wake(
        config,
        SimulatedDht,
        |model| init_engine(EMBEDDED_MODEL, model.arena_bytes),
        HostNetwork,
        backend,
        ThreadDelay,
    )
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("weather station simulator started");

    loop {
        let outcome = tokio::task::spawn_blocking(wake_once)
            .await
            .context("wake task panicked")?;

        info!("wake finished in {:?} phase", outcome.phase());
        match outcome {
            WakeOutcome::DeepSleep { duration, report } => {
                if let Some(err) = report.error {
                    warn!("cycle finished with error: {err}");
                }
                info!("simulating deep sleep for {}s", duration.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown requested");
                        return Ok(());
                    }
                }
            }
            WakeOutcome::Restart { attempts } => {
                warn!("restart requested after {attempts} association attempts");
            }
            WakeOutcome::Halt(err) => {
                return Err(anyhow::Error::new(err).context("station halted"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use axum::{
        extract::{RawQuery, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use tokio::{net::TcpListener, sync::Mutex};
    use weather_common::{Classification, WeatherCondition};

    use super::*;

    #[derive(Debug, Clone)]
    struct RecordedWrite {
        query: String,
        authorization: String,
        body: String,
    }

    type Recorded = Arc<Mutex<Vec<RecordedWrite>>>;

    async fn record_write(
        State(recorded): State<Recorded>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        recorded.lock().await.push(RecordedWrite {
            query: query.unwrap_or_default(),
            authorization,
            body,
        });
        StatusCode::NO_CONTENT
    }

    async fn reject_write() -> (StatusCode, Json<serde_json::Value>) {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"code": "unauthorized", "message": "unauthorized access"})),
        )
    }

    async fn spawn_fake_influx(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn influx_config(addr: SocketAddr) -> InfluxConfig {
        InfluxConfig {
            url: format!("http://{addr}"),
            org: "lab".to_string(),
            bucket: "weather".to_string(),
            token: "t0k3n".to_string(),
            ..InfluxConfig::default()
        }
    }

    fn point(influx: &InfluxConfig) -> TelemetryPoint {
        let sample = SensorSample::from_readings(25.0, 60.0);
        let classification = Classification {
            condition: WeatherCondition::Cloudy,
            score: 0.37,
        };
        TelemetryPoint::from_reading(influx, &sample, &classification, Some(1_648_987_200))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_point_written_twice_is_recorded_twice() {
        let recorded = Recorded::default();
        let router = Router::new()
            .route("/api/v2/write", post(record_write))
            .route("/health", get(|| async { Json(serde_json::json!({"status": "pass"})) }))
            .with_state(recorded.clone());
        let influx = influx_config(spawn_fake_influx(router).await);
        let point = point(&influx);

        let result = tokio::task::spawn_blocking(move || {
            let mut backend = HttpInfluxBackend::new(&influx);
            backend.validate_connection()?;
            backend.write_point(&point)?;
            backend.write_point(&point)
        })
        .await
        .unwrap();
        assert!(result.is_ok(), "{result:?}");

        let writes = recorded.lock().await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].body, writes[1].body);
        assert_eq!(writes[0].authorization, "Token t0k3n");
        assert_eq!(writes[0].query, "org=lab&bucket=weather&precision=s");
        assert!(writes[0].body.contains("Weather\\ Condition=\"cloudy\""));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_write_surfaces_backend_message() {
        let router = Router::new().route("/api/v2/write", post(reject_write));
        let influx = influx_config(spawn_fake_influx(router).await);
        let point = point(&influx);

        let result = tokio::task::spawn_blocking(move || {
            HttpInfluxBackend::new(&influx).write_point(&point)
        })
        .await
        .unwrap();

        match result {
            Err(TelemetryError::Rejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "unauthorized: unauthorized access");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_health_endpoint_fails_validation() {
        let router = Router::new().route("/api/v2/write", post(reject_write));
        let influx = influx_config(spawn_fake_influx(router).await);

        let result = tokio::task::spawn_blocking(move || {
            HttpInfluxBackend::new(&influx).validate_connection()
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(TelemetryError::Connection(_))));
    }

    #[test]
    fn simulated_readings_stay_in_range() {
        let sample = SimulatedDht.read_sample();
        assert!((18.0..33.0).contains(&sample.temperature_c));
        assert!((35.0..95.0).contains(&sample.humidity));
        assert!(sample.is_valid());
    }
}
