use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::validators::ValidationError;

/// Greenhouse record as served by the backend
/// The client only ever holds a read-only cached copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greenhouse {
    pub greenhouse_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Greenhouse {
    /// Field at `index`, if the greenhouse has that many fields
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }
}

/// Sensor reading or actuator status sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub timestamp: String,
}

/// One sub-area of a greenhouse: four sensor sequences and three actuator sequences
/// Each sequence is ordered newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub temperature_sensor: Vec<Reading>,
    #[serde(default)]
    pub humidity_sensor: Vec<Reading>,
    #[serde(default)]
    pub soil_moisture_sensor: Vec<Reading>,
    #[serde(default)]
    pub light_sensor: Vec<Reading>,
    #[serde(default)]
    pub fan_status: Vec<Reading>,
    #[serde(default)]
    pub led_status: Vec<Reading>,
    #[serde(default)]
    pub pump_status: Vec<Reading>,
}

impl Field {
    pub fn series(&self, series: Series) -> &[Reading] {
        match series {
            Series::Temperature => &self.temperature_sensor,
            Series::Humidity => &self.humidity_sensor,
            Series::SoilMoisture => &self.soil_moisture_sensor,
            Series::Light => &self.light_sensor,
            Series::Fan => &self.fan_status,
            Series::Led => &self.led_status,
            Series::Pump => &self.pump_status,
        }
    }

    pub fn series_mut(&mut self, series: Series) -> &mut Vec<Reading> {
        match series {
            Series::Temperature => &mut self.temperature_sensor,
            Series::Humidity => &mut self.humidity_sensor,
            Series::SoilMoisture => &mut self.soil_moisture_sensor,
            Series::Light => &mut self.light_sensor,
            Series::Fan => &mut self.fan_status,
            Series::Led => &mut self.led_status,
            Series::Pump => &mut self.pump_status,
        }
    }

    /// Newest reading of a series (index 0)
    pub fn latest(&self, series: Series) -> Option<&Reading> {
        self.series(series).first()
    }
}

/// The seven per-field sequences, named by their JSON keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Series {
    #[serde(rename = "temperature_sensor")]
    Temperature,
    #[serde(rename = "humidity_sensor")]
    Humidity,
    #[serde(rename = "soil_moisture_sensor")]
    SoilMoisture,
    #[serde(rename = "light_sensor")]
    Light,
    #[serde(rename = "fan_status")]
    Fan,
    #[serde(rename = "led_status")]
    Led,
    #[serde(rename = "pump_status")]
    Pump,
}

impl Series {
    pub const ALL: [Series; 7] = [
        Series::Temperature,
        Series::Humidity,
        Series::SoilMoisture,
        Series::Light,
        Series::Fan,
        Series::Led,
        Series::Pump,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Series::Temperature => "temperature_sensor",
            Series::Humidity => "humidity_sensor",
            Series::SoilMoisture => "soil_moisture_sensor",
            Series::Light => "light_sensor",
            Series::Fan => "fan_status",
            Series::Led => "led_status",
            Series::Pump => "pump_status",
        }
    }

    pub fn from_key(key: &str) -> Option<Series> {
        Series::ALL.into_iter().find(|s| s.key() == key)
    }

    /// Actuator driving this series, if it is an actuator status series
    pub fn device(self) -> Option<DeviceKind> {
        match self {
            Series::Fan => Some(DeviceKind::Fan),
            Series::Led => Some(DeviceKind::Led),
            Series::Pump => Some(DeviceKind::Pump),
            _ => None,
        }
    }

    pub fn is_actuator(self) -> bool {
        self.device().is_some()
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Series {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Series::from_key(s).ok_or_else(|| {
            ValidationError::new(
                "sensor_type",
                format!(
                    "Unknown series '{}'. Valid values: {}",
                    s,
                    Series::ALL.map(Series::key).join(", ")
                ),
            )
        })
    }
}

/// Controllable actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Fan,
    Led,
    Pump,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Fan, DeviceKind::Led, DeviceKind::Pump];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Fan => "fan",
            DeviceKind::Led => "led",
            DeviceKind::Pump => "pump",
        }
    }

    /// Status series reporting this device's live intensity
    pub fn status_series(self) -> Series {
        match self {
            DeviceKind::Fan => Series::Fan,
            DeviceKind::Led => Series::Led,
            DeviceKind::Pump => Series::Pump,
        }
    }

    /// Metadata key holding this device's configuration (`config_fan`, ...)
    pub fn config_key(self) -> String {
        format!("config_{}", self.as_str())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fan" => Ok(DeviceKind::Fan),
            "led" => Ok(DeviceKind::Led),
            "pump" => Ok(DeviceKind::Pump),
            _ => Err(ValidationError::new(
                "device",
                format!("Unknown device '{}'. Valid values: fan, led, pump", s),
            )),
        }
    }
}

/// Operating mode stored in a device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Manual,
    #[serde(alias = "schedule")]
    Scheduled,
    Automatic,
}

/// Repeat rule of a scheduled configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatRule {
    Today,
    Everyday,
    Custom,
}

impl FromStr for RepeatRule {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(RepeatRule::Today),
            "everyday" => Ok(RepeatRule::Everyday),
            "custom" => Ok(RepeatRule::Custom),
            _ => Err(ValidationError::new(
                "repeat",
                format!("Unknown repeat rule '{}'. Valid values: today, everyday, custom", s),
            )),
        }
    }
}

/// Persisted configuration of one device
/// Only the keys relevant to the mode are present on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeviceMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_off_after: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_on_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dates: Option<Vec<String>>,
}

/// Field metadata: per-device configuration plus whatever else the backend keeps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_fan: Option<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_led: Option<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_pump: Option<DeviceConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FieldMetadata {
    pub fn config(&self, device: DeviceKind) -> Option<&DeviceConfig> {
        match device {
            DeviceKind::Fan => self.config_fan.as_ref(),
            DeviceKind::Led => self.config_led.as_ref(),
            DeviceKind::Pump => self.config_pump.as_ref(),
        }
    }
}

/// Response of the field settings read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSettings {
    pub field_index: usize,
    #[serde(default)]
    pub sensors: Field,
    #[serde(default)]
    pub metadata: FieldMetadata,
}

/// Paging and filter parameters for the greenhouse list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub owner: Option<String>,
    pub location: Option<String>,
    pub offset: u32,
    pub limit: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            owner: None,
            location: None,
            offset: 0,
            limit: 10,
        }
    }
}

/// Parameters of a field history read (RFC3339 bounds)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub series: Series,
    pub start_time: String,
    pub end_time: String,
}

impl HistoryQuery {
    /// Window covering the `hours` preceding the clock's current time
    pub fn last_hours(series: Series, clock: &dyn crate::time::Clock, hours: i64) -> Self {
        let end = clock.now();
        let start = end - chrono::Duration::hours(hours);
        Self {
            series,
            start_time: crate::time::format_rfc3339(start),
            end_time: crate::time::format_rfc3339(end),
        }
    }
}

/// Analytics document for a greenhouse; the client does not interpret it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Analytics(pub Value);

/// Real-time push payload replacing one series of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greenhouse_id: Option<String>,
    pub field_index: usize,
    pub sensor_type: String,
    pub sensor_data: Vec<Reading>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedClock;

    fn reading(value: f64, ts: &str) -> Reading {
        Reading {
            value,
            unit: "C".to_string(),
            timestamp: ts.to_string(),
        }
    }

    #[test]
    fn test_greenhouse_deserializes_backend_shape() {
        let json = r#"{
            "greenhouse_id": "gh_1",
            "name": "North",
            "location": "Da Lat",
            "owner": "alice",
            "fields": [{
                "temperature_sensor": [{"value": 24.5, "unit": "C", "timestamp": "2025-05-01T10:00:00Z"}],
                "fan_status": [{"value": 100, "unit": "%", "timestamp": "2025-05-01T10:00:00Z"}]
            }],
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-05-01T10:00:00Z",
            "metadata": {"crop": "tomato"}
        }"#;

        let gh: Greenhouse = serde_json::from_str(json).unwrap();
        assert_eq!(gh.greenhouse_id, "gh_1");
        assert_eq!(gh.fields.len(), 1);

        let field = gh.field(0).unwrap();
        assert_eq!(field.latest(Series::Temperature).unwrap().value, 24.5);
        assert_eq!(field.latest(Series::Fan).unwrap().value, 100.0);
        assert!(field.series(Series::Humidity).is_empty());
        assert!(gh.field(1).is_none());
        assert_eq!(gh.metadata["crop"], "tomato");
    }

    #[test]
    fn test_series_keys_round_trip() {
        for series in Series::ALL {
            assert_eq!(Series::from_key(series.key()), Some(series));
            let json = serde_json::to_string(&series).unwrap();
            assert_eq!(json, format!("\"{}\"", series.key()));
        }
        assert_eq!(Series::from_key("co2_sensor"), None);
        assert!("co2_sensor".parse::<Series>().is_err());
    }

    #[test]
    fn test_series_mut_replaces_sequence() {
        let mut field = Field::default();
        *field.series_mut(Series::Light) = vec![reading(800.0, "t1"), reading(750.0, "t0")];

        assert_eq!(field.light_sensor.len(), 2);
        assert_eq!(field.latest(Series::Light).unwrap().timestamp, "t1");
    }

    #[test]
    fn test_series_device_mapping() {
        assert_eq!(Series::Fan.device(), Some(DeviceKind::Fan));
        assert_eq!(Series::Temperature.device(), None);
        assert!(Series::Pump.is_actuator());
        assert!(!Series::SoilMoisture.is_actuator());

        for device in DeviceKind::ALL {
            assert_eq!(device.status_series().device(), Some(device));
        }
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!("fan".parse::<DeviceKind>().unwrap(), DeviceKind::Fan);
        assert_eq!("LED".parse::<DeviceKind>().unwrap(), DeviceKind::Led);
        assert_eq!(DeviceKind::Pump.config_key(), "config_pump");

        let err = "heater".parse::<DeviceKind>().unwrap_err();
        assert_eq!(err.field, "device");
    }

    #[test]
    fn test_device_config_skips_unset_keys() {
        let config = DeviceConfig {
            mode: Some(DeviceMode::Manual),
            turn_off_after: Some(0),
            ..Default::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "manual", "turn_off_after": 0}));
    }

    #[test]
    fn test_device_mode_accepts_schedule_alias() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"mode": "schedule", "repeat": "everyday"}"#).unwrap();
        assert_eq!(config.mode, Some(DeviceMode::Scheduled));
        assert_eq!(config.repeat, Some(RepeatRule::Everyday));
    }

    #[test]
    fn test_field_settings_deserializes() {
        let json = r#"{
            "field_index": 1,
            "sensors": {
                "led_status": [{"value": 40, "unit": "%", "timestamp": "2025-05-01T10:00:00Z"}]
            },
            "metadata": {
                "config_led": {"mode": "scheduled", "turn_on_at": "07:30", "turn_off_after": 15,
                               "repeat": "custom", "dates": ["2025-05-02"]},
                "config_fan": null,
                "planted": "2025-04-01"
            }
        }"#;

        let settings: FieldSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.field_index, 1);
        assert_eq!(settings.sensors.latest(Series::Led).unwrap().value, 40.0);

        let led = settings.metadata.config(DeviceKind::Led).unwrap();
        assert_eq!(led.turn_on_at.as_deref(), Some("07:30"));
        assert_eq!(led.dates.as_ref().unwrap().len(), 1);
        assert!(settings.metadata.config(DeviceKind::Fan).is_none());
        assert_eq!(settings.metadata.extra["planted"], "2025-04-01");
    }

    #[test]
    fn test_list_query_defaults() {
        let query = ListQuery::default();
        assert_eq!(query.offset, 0);
        assert_eq!(query.limit, 10);
        assert!(query.owner.is_none());
    }

    #[test]
    fn test_history_query_last_hours() {
        let clock = FixedClock::from_rfc3339("2025-05-02T12:00:00Z").unwrap();
        let query = HistoryQuery::last_hours(Series::Humidity, &clock, 24);

        assert_eq!(query.series, Series::Humidity);
        assert_eq!(query.start_time, "2025-05-01T12:00:00Z");
        assert_eq!(query.end_time, "2025-05-02T12:00:00Z");
    }

    #[test]
    fn test_sensor_update_deserializes() {
        let update: SensorUpdate = serde_json::from_str(
            r#"{"field_index": 0, "sensor_type": "humidity_sensor",
                "sensor_data": [{"value": 61.0, "unit": "%", "timestamp": "t"}]}"#,
        )
        .unwrap();
        assert!(update.greenhouse_id.is_none());
        assert_eq!(update.sensor_data[0].value, 61.0);
    }
}
