use serde::Deserialize;

use crate::config::InfluxConfig;

pub const WRITE_PRECISION: &str = "s";
pub const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn write_url(influx: &InfluxConfig) -> String {
    format!(
        "{}/api/v2/write?org={}&bucket={}&precision={}",
        influx.url.trim_end_matches('/'),
        encode_query_value(&influx.org),
        encode_query_value(&influx.bucket),
        WRITE_PRECISION
    )
}

pub fn health_url(influx: &InfluxConfig) -> String {
    format!("{}/health", influx.url.trim_end_matches('/'))
}

pub fn authorization_header(influx: &InfluxConfig) -> String {
    format!("Token {}", influx.token)
}

pub fn error_message(status: u16, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        match (parsed.code, parsed.message) {
            (Some(code), Some(message)) => return format!("{code}: {message}"),
            (None, Some(message)) => return message,
            _ => {}
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {status}")
    } else {
        text.to_string()
    }
}

fn encode_query_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
