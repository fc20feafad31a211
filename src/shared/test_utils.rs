//! Test utilities for property-based and integration tests
//!
//! `generators` holds proptest strategies for the values the validators and
//! the frame codec accept or reject. `fixtures` builds sample greenhouse
//! records and backend responses.

pub mod generators {
    use proptest::prelude::*;

    use crate::domain::{Reading, Series};

    /// Generate a valid email address
    pub fn email() -> impl Strategy<Value = String> {
        (
            "[a-z0-9._%+-]{1,32}",
            "[a-z0-9-]{1,20}",
            "[a-z]{2,6}",
        )
            .prop_map(|(local, domain, tld)| format!("{}@{}.{}", local, domain, tld))
    }

    /// Generate an invalid email address
    pub fn invalid_email() -> impl Strategy<Value = String> {
        prop_oneof![
            // Missing @
            Just("plainaddress".to_string()),
            // Missing domain
            Just("user@".to_string()),
            // Missing local part
            Just("@example.com".to_string()),
            // Single-letter TLD
            Just("user@example.c".to_string()),
            // Whitespace
            Just("user name@example.com".to_string()),
            // Empty
            Just("".to_string()),
        ]
    }

    /// Generate a password of acceptable length
    pub fn password() -> impl Strategy<Value = String> {
        prop::string::string_regex("[A-Za-z0-9!@#$%^&*]{6,128}").expect("Valid regex for password")
    }

    /// Generate a greenhouse identifier safe to use in URL paths
    pub fn greenhouse_id() -> impl Strategy<Value = String> {
        prop::string::string_regex("[A-Za-z0-9_-]{1,128}").expect("Valid regex for greenhouse_id")
    }

    /// Generate an identifier the validator must reject
    pub fn invalid_greenhouse_id() -> impl Strategy<Value = String> {
        prop_oneof![
            // Empty
            Just("".to_string()),
            // Too long
            prop::string::string_regex("[a-z]{129,160}").expect("Valid regex"),
            // Path separators and query characters
            Just("gh/1".to_string()),
            Just("gh?id=1".to_string()),
            Just("../etc".to_string()),
            Just("gh 1".to_string()),
        ]
    }

    /// Generate a valid `HH:MM` time of day
    pub fn time_of_day() -> impl Strategy<Value = String> {
        (0u32..24, 0u32..60).prop_map(|(h, m)| format!("{:02}:{:02}", h, m))
    }

    /// Generate a valid `YYYY-MM-DD` date
    pub fn schedule_date() -> impl Strategy<Value = String> {
        (2020i32..2035, 1u32..=12, 1u32..=28)
            .prop_map(|(y, m, d)| format!("{:04}-{:02}-{:02}", y, m, d))
    }

    /// Generate an RFC 3339 timestamp between 2020 and 2030
    pub fn timestamp() -> impl Strategy<Value = String> {
        // 2020-01-01 00:00:00 UTC .. 2030-12-31 23:59:59 UTC
        (1577836800i64..1924991999i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0)
                .map(crate::time::format_rfc3339)
                .unwrap_or_default()
        })
    }

    pub fn series() -> impl Strategy<Value = Series> {
        prop::sample::select(Series::ALL.to_vec())
    }

    /// Generate a reading with a value plausible for `series`
    pub fn reading_for(series: Series) -> impl Strategy<Value = Reading> {
        let values = match series {
            Series::Temperature => -40.0..85.0,
            Series::Light => 0.0..100000.0,
            _ => 0.0..100.0,
        };
        (values, timestamp()).prop_map(move |(value, timestamp)| Reading {
            value,
            unit: unit_for(series).to_string(),
            timestamp,
        })
    }

    fn unit_for(series: Series) -> &'static str {
        match series {
            Series::Temperature => "C",
            Series::Light => "lux",
            _ => "%",
        }
    }

    /// Generate a header name or value, including characters that need escaping
    pub fn header_text() -> impl Strategy<Value = String> {
        prop::string::string_regex("[A-Za-z0-9 :\\\\\r\n/_.-]{0,40}").expect("Valid regex for header")
    }

    /// Generate a frame body without NUL bytes
    pub fn frame_body() -> impl Strategy<Value = String> {
        prop::string::string_regex("[^\\x00]{0,200}").expect("Valid regex for body")
    }
}

pub mod fixtures {
    use serde_json::{json, Map, Value};

    use crate::domain::{Field, Greenhouse, Reading};

    pub fn reading(value: f64, timestamp: &str) -> Reading {
        Reading {
            value,
            unit: String::new(),
            timestamp: timestamp.to_string(),
        }
    }

    /// A field whose every series holds one reading at `timestamp`
    pub fn field(temperature: f64, timestamp: &str) -> Field {
        Field {
            temperature_sensor: vec![reading(temperature, timestamp)],
            humidity_sensor: vec![reading(55.0, timestamp)],
            soil_moisture_sensor: vec![reading(40.0, timestamp)],
            light_sensor: vec![reading(800.0, timestamp)],
            fan_status: vec![reading(0.0, timestamp)],
            led_status: vec![reading(100.0, timestamp)],
            pump_status: vec![reading(0.0, timestamp)],
        }
    }

    pub fn greenhouse(id: &str, temperature: f64, field_count: usize) -> Greenhouse {
        Greenhouse {
            greenhouse_id: id.to_string(),
            name: format!("Greenhouse {}", id),
            location: "Da Lat".to_string(),
            owner: "grower@example.com".to_string(),
            fields: (0..field_count)
                .map(|_| field(temperature, "2025-05-01T10:00:00Z"))
                .collect(),
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
        }
    }

    /// Backend envelope wrapping `data`
    pub fn envelope(data: Value) -> String {
        json!({
            "success": true,
            "status": "OK",
            "message": "OK",
            "data": data,
        })
        .to_string()
    }

    pub fn greenhouse_list_body(greenhouses: &[Greenhouse]) -> String {
        envelope(serde_json::to_value(greenhouses).unwrap_or(Value::Null))
    }

    pub fn greenhouse_body(greenhouse: &Greenhouse) -> String {
        envelope(serde_json::to_value(greenhouse).unwrap_or(Value::Null))
    }

    /// Unsigned JWT carrying the given claims
    pub fn jwt(claims: Value) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, payload)
    }
}
