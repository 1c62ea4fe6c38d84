//! # HAR Sentence Codec
//!
//! Decodes the `$$HAR` sentences emitted by the balloon tracker over its
//! serial link. Every field after the prefix is an integer in a fixed-point
//! unit; decoding scales them to engineering units.
//!
//! | index | field         | raw unit      | scale     |
//! |-------|---------------|---------------|-----------|
//! | 1     | `latitude`    | 1e-7 degree   | / 1e7     |
//! | 2     | `longitude`   | 1e-7 degree   | / 1e7     |
//! | 3     | `altitude`    | millimetre    | / 1000    |
//! | 4     | `heading`     | 1e-5 degree   | / 1e5     |
//! | 5     | `speed`       | dm/s          | / 10      |
//! | 6     | `pdop`        | 1/10          | / 10      |
//! | 7     | `pressure`    | Pa            | / 100     |
//! | 8     | `temperature` | 1/100 °C      | / 100     |
//! | 9     | `humidity`    | 1/1000 %      | / 1000    |
//! | 11    | `battery`     | as sent       | 1         |
//!
//! Index 10 is not used by the ground station.

use serde_json::json;
use thiserror::Error;

use crate::core::types::{Identifier, TelemetryDatum};

pub const HAR_PREFIX: &str = "$$HAR";

const FIELD_COUNT: usize = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarError {
    #[error("line does not start with $$HAR")]
    NotHar,
    #[error("sentence has {0} field(s), expected at least 12")]
    TooFewFields(usize),
    #[error("field {index} is not a number: '{raw}'")]
    InvalidField { index: usize, raw: String },
}

/// One decoded tracker sentence in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarSentence {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub altitude: f64,
    pub heading: f64,
    pub speed: f64,
    pub pdop: f64,
    /// hPa.
    pub pressure: f64,
    /// °C.
    pub temperature: f64,
    /// Percent relative humidity.
    pub humidity: f64,
    pub battery: f64,
}

impl HarSentence {
    pub fn parse(line: &str) -> Result<Self, HarError> {
        let line = line.trim();
        if !line.starts_with(HAR_PREFIX) {
            return Err(HarError::NotHar);
        }

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < FIELD_COUNT {
            return Err(HarError::TooFewFields(fields.len()));
        }

        let field = |index: usize| -> Result<f64, HarError> {
            let raw = fields[index].trim();
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| HarError::InvalidField {
                    index,
                    raw: raw.to_string(),
                })
        };

        Ok(Self {
            latitude: field(1)? / 1e7,
            longitude: field(2)? / 1e7,
            altitude: field(3)? / 1000.0,
            heading: field(4)? / 1e5,
            speed: field(5)? / 10.0,
            pdop: field(6)? / 10.0,
            pressure: field(7)? / 100.0,
            temperature: field(8)? / 100.0,
            humidity: field(9)? / 1000.0,
            battery: field(11)?,
        })
    }

    fn values(&self) -> [(&'static str, f64); 10] {
        [
            ("latitude", self.latitude),
            ("longitude", self.longitude),
            ("altitude", self.altitude),
            ("temperature", self.temperature),
            ("pressure", self.pressure),
            ("humidity", self.humidity),
            ("battery", self.battery),
            ("speed", self.speed),
            ("pdop", self.pdop),
            ("heading", self.heading),
        ]
    }

    /// Encodes the sentence as an ingestion wire message.
    pub fn to_wire_message(&self, timestamp_ms: i64) -> serde_json::Value {
        let data: serde_json::Map<String, serde_json::Value> = self
            .values()
            .into_iter()
            .map(|(key, value)| (key.to_string(), json!(value)))
            .collect();
        json!({ "timestamp": timestamp_ms, "data": data })
    }

    pub fn to_datum(&self, identifier: Identifier, timestamp_ms: i64) -> TelemetryDatum {
        self.values()
            .into_iter()
            .fold(TelemetryDatum::new(identifier, timestamp_ms), |datum, (key, value)| {
                datum.with_value(key, value)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Scalar;
    use crate::ingestors::telemetry_wss::parse_message;

    const SAMPLE: &str = "$$HAR,420350000,-936130000,1523400,27000000,125,12,97325,-1250,45500,0,7";

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn parses_and_scales_fields() {
        let har = HarSentence::parse(SAMPLE).unwrap();
        assert!(close(har.latitude, 42.035));
        assert!(close(har.longitude, -93.613));
        assert!(close(har.altitude, 1523.4));
        assert!(close(har.heading, 270.0));
        assert!(close(har.speed, 12.5));
        assert!(close(har.pdop, 1.2));
        assert!(close(har.pressure, 973.25));
        assert!(close(har.temperature, -12.5));
        assert!(close(har.humidity, 45.5));
        assert!(close(har.battery, 7.0));
    }

    #[test]
    fn rejects_other_lines() {
        assert_eq!(HarSentence::parse("GPS lock acquired"), Err(HarError::NotHar));
        assert_eq!(HarSentence::parse("$$HAR,1,2,3"), Err(HarError::TooFewFields(4)));
        assert_eq!(
            HarSentence::parse("$$HAR,1,2,x,4,5,6,7,8,9,10,11"),
            Err(HarError::InvalidField { index: 3, raw: "x".into() })
        );
    }

    #[test]
    fn wire_message_is_accepted_by_the_ingestor() {
        let har = HarSentence::parse(SAMPLE).unwrap();
        let id = Identifier::new("example.telemetry", "websocket.telemetry");
        let text = har.to_wire_message(1_700_000_000_000).to_string();

        let datum = parse_message(&text, &id).unwrap();
        assert_eq!(datum, har.to_datum(id, 1_700_000_000_000));
        assert_eq!(datum.get("battery"), Some(&Scalar::Float(7.0)));
    }
}
