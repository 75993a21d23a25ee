//! `sonarlink-types` – shared data model and error taxonomy.
//!
//! Everything that crosses a crate boundary lives here: the static sensor
//! table ([`SensorConfig`]), the callback payload delivered by the
//! microcontroller bridge ([`SonarPayload`]), the cached per-sensor
//! [`Reading`], the derived [`PublishTopic`], the validated
//! [`MonitorConfig`] handed to the supervisor, and [`SonarError`].

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance reported by a channel that has not received a reading yet, or
/// whose pins could not be registered.
pub const SENTINEL_DISTANCE_CM: u32 = 0;

/// Highest pin number the bridge protocol can address (one 7-bit data byte).
pub const MAX_PIN: u8 = 127;

// ─────────────────────────────────────────────────────────────────────────────
// Sensors and readings
// ─────────────────────────────────────────────────────────────────────────────

/// Static wiring of one ultrasonic sensor to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Identifier appended to the base topic, e.g. `2` → `"arduino/distance2"`.
    pub id: u8,
    pub trigger_pin: u8,
    pub echo_pin: u8,
}

impl SensorConfig {
    pub fn new(id: u8, trigger_pin: u8, echo_pin: u8) -> Self {
        Self {
            id,
            trigger_pin,
            echo_pin,
        }
    }

    /// Both pins, trigger first.
    pub fn pins(&self) -> [u8; 2] {
        [self.trigger_pin, self.echo_pin]
    }
}

/// Kind of report carried by a [`SonarPayload`].
///
/// Distance reports are the only kind this system consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    SonarDistance,
}

impl SourceType {
    /// Pin-type code used by Firmata client libraries for this report.
    pub const fn firmata_code(self) -> u8 {
        match self {
            SourceType::SonarDistance => 12,
        }
    }
}

/// Fixed-shape payload the bridge hands to a registered `on_reading`
/// callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SonarPayload {
    pub source: SourceType,
    pub trigger_pin: u8,
    pub distance_cm: u32,
    pub timestamp: DateTime<Utc>,
}

impl SonarPayload {
    /// Build a distance report observed now.
    pub fn sonar(trigger_pin: u8, distance_cm: u32) -> Self {
        Self {
            source: SourceType::SonarDistance,
            trigger_pin,
            distance_cm,
            timestamp: Utc::now(),
        }
    }
}

/// Latest cached measurement of one sensor.
///
/// The default value is the sentinel: distance 0, never observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reading {
    pub distance_cm: u32,
    pub observed_at: Option<DateTime<Utc>>,
}

impl Reading {
    /// `true` until the first callback for the sensor has been stored.
    pub fn is_sentinel(&self) -> bool {
        self.observed_at.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Topics
// ─────────────────────────────────────────────────────────────────────────────

/// Broker topic of one sensor: the base topic with the sensor id appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublishTopic(String);

impl PublishTopic {
    pub fn new(base_topic: &str, sensor_id: u8) -> Self {
        Self(format!("{base_topic}{sensor_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublishTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// MQTT broker connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum period between communications with the broker.
    pub keepalive_secs: u16,
    pub client_id: String,
    /// How long to wait for the broker's CONNACK.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_secs: 60,
            client_id: "sonarlink".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// Serial link to the microcontroller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Explicit device path (`/dev/ttyACM0`, `COM3`).  When unset the first
    /// USB serial port whose vendor id is in `usb_vendor_ids` is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub usb_vendor_ids: Vec<u16>,
    /// Upper bound on the firmware handshake after opening the port.  Most
    /// boards reboot when the port opens, so this must cover the bootloader.
    pub handshake_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: 115_200,
            // Arduino LLC, Arduino SRL, WCH CH340, FTDI.
            usb_vendor_ids: vec![0x2341, 0x2A03, 0x1A86, 0x0403],
            handshake_timeout_ms: 4_000,
        }
    }
}

/// Complete, immutable configuration of one monitor run.
///
/// Built once at startup (see `sonarlink-cli`'s config vault), validated with
/// [`MonitorConfig::validate`], then passed by value into the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Prefix of every publish topic; the sensor id is appended verbatim.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Pause after each full pass over the sensors.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Pause between initialisation attempts while the device is not ready.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: f64,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorConfig>,
}

fn default_base_topic() -> String {
    "arduino/distance".to_string()
}
fn default_poll_interval_secs() -> f64 {
    0.5
}
fn default_retry_backoff_secs() -> f64 {
    1.0
}
fn default_sensors() -> Vec<SensorConfig> {
    vec![
        SensorConfig::new(0, 2, 8),
        SensorConfig::new(1, 3, 9),
        SensorConfig::new(2, 4, 10),
        SensorConfig::new(3, 5, 11),
    ]
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            poll_interval_secs: default_poll_interval_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            broker: BrokerConfig::default(),
            bridge: BridgeConfig::default(),
            sensors: default_sensors(),
        }
    }
}

impl MonitorConfig {
    /// Check every structural invariant of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::Configuration`] describing the first violation:
    /// an empty sensor table, a duplicate id, a zero pin, a sensor whose
    /// trigger and echo coincide, a pin shared by two sensors, a non-positive
    /// poll interval, a negative backoff, an empty broker host, or MQTT
    /// wildcards in the base topic.
    pub fn validate(&self) -> Result<(), SonarError> {
        if self.sensors.is_empty() {
            return Err(SonarError::Configuration(
                "at least one sensor must be configured".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut pins = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(sensor.id) {
                return Err(SonarError::Configuration(format!(
                    "sensor id {} is configured more than once",
                    sensor.id
                )));
            }
            if sensor.trigger_pin == 0 || sensor.echo_pin == 0 {
                return Err(SonarError::Configuration(format!(
                    "sensor {}: pin numbers must be positive",
                    sensor.id
                )));
            }
            if sensor.trigger_pin > MAX_PIN || sensor.echo_pin > MAX_PIN {
                return Err(SonarError::Configuration(format!(
                    "sensor {}: pin numbers must not exceed {MAX_PIN}",
                    sensor.id
                )));
            }
            if sensor.trigger_pin == sensor.echo_pin {
                return Err(SonarError::Configuration(format!(
                    "sensor {}: trigger and echo must be different pins",
                    sensor.id
                )));
            }
            for pin in sensor.pins() {
                if !pins.insert(pin) {
                    return Err(SonarError::Configuration(format!(
                        "sensor {}: pin {pin} is already used by another sensor",
                        sensor.id
                    )));
                }
            }
        }

        if !(self.poll_interval_secs.is_finite() && self.poll_interval_secs > 0.0) {
            return Err(SonarError::Configuration(format!(
                "poll_interval_secs must be a positive number, got {}",
                self.poll_interval_secs
            )));
        }
        if !(self.retry_backoff_secs.is_finite() && self.retry_backoff_secs >= 0.0) {
            return Err(SonarError::Configuration(format!(
                "retry_backoff_secs must be zero or positive, got {}",
                self.retry_backoff_secs
            )));
        }
        if self.broker.host.trim().is_empty() {
            return Err(SonarError::Configuration(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.base_topic.contains(['+', '#']) {
            return Err(SonarError::Configuration(format!(
                "base_topic '{}' must not contain MQTT wildcards",
                self.base_topic
            )));
        }
        Ok(())
    }

    /// Inter-tick sleep of the poll loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs)
            .unwrap_or_else(|_| Duration::from_millis(500))
    }

    /// Delay between initialisation attempts on [`SonarError::DeviceNotReady`].
    pub fn retry_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_backoff_secs)
            .unwrap_or_else(|_| Duration::from_secs(1))
    }

    /// Topic that sensor `id` publishes to.
    pub fn topic_for(&self, id: u8) -> PublishTopic {
        PublishTopic::new(&self.base_topic, id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy spanning the bridge, the broker link and configuration.
///
/// Only [`SonarError::DeviceNotReady`] is recoverable at the supervisor
/// level; see [`SonarError::is_recoverable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SonarError {
    /// The expected microcontroller is not (yet) attached or not answering.
    #[error("Device Not Ready: {0}")]
    DeviceNotReady(String),

    #[error("Pin Conflict on trigger {trigger_pin} / echo {echo_pin}: {details}")]
    PinConflict {
        trigger_pin: u8,
        echo_pin: u8,
        details: String,
    },

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Bridge Connection Error: {0}")]
    BridgeConnection(String),

    #[error("Broker Connection Error: {0}")]
    BrokerConnection(String),

    #[error("Configuration Error: {0}")]
    Configuration(String),
}

impl SonarError {
    /// `true` for conditions the supervisor answers with another
    /// initialisation attempt instead of terminating.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SonarError::DeviceNotReady(_))
    }

    /// `true` for faults confined to a single sensor channel.
    pub fn is_channel_local(&self) -> bool {
        matches!(
            self,
            SonarError::PinConflict { .. } | SonarError::HardwareFault { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_base_plus_id() {
        assert_eq!(PublishTopic::new("arduino/distance", 3).as_str(), "arduino/distance3");
        assert_eq!(PublishTopic::new("", 0).to_string(), "0");
    }

    #[test]
    fn default_topics_are_unique() {
        let cfg = MonitorConfig::default();
        let topics: HashSet<_> = cfg.sensors.iter().map(|s| cfg.topic_for(s.id)).collect();
        assert_eq!(topics.len(), cfg.sensors.len());
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = MonitorConfig::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.sensors.len(), 4);
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.broker.keepalive_secs, 60);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.retry_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.sensors.push(SensorConfig::new(1, 20, 21));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, SonarError::Configuration(_)));
        assert!(err.to_string().contains("sensor id 1"));
    }

    #[test]
    fn shared_pin_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.sensors.push(SensorConfig::new(9, 12, 8));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pin 8"));
    }

    #[test]
    fn zero_pin_and_identical_pins_are_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.sensors = vec![SensorConfig::new(0, 0, 8)];
        assert!(cfg.validate().is_err());

        cfg.sensors = vec![SensorConfig::new(0, 7, 7)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pins_beyond_seven_bits_are_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.sensors = vec![SensorConfig::new(0, 130, 8)];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed 127"));

        cfg.sensors = vec![SensorConfig::new(0, 2, 128)];
        assert!(cfg.validate().is_err());

        cfg.sensors = vec![SensorConfig::new(0, 126, 127)];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_sensor_table_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.sensors.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.poll_interval_secs = 0.0;
        assert!(cfg.validate().is_err());
        cfg.poll_interval_secs = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn wildcard_base_topic_is_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.base_topic = "sensors/+/distance".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let raw = r#"
            base_topic = "garage/sonar"

            [broker]
            host = "10.0.0.5"

            [[sensors]]
            id = 7
            trigger_pin = 2
            echo_pin = 3
        "#;
        let cfg: MonitorConfig = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.base_topic, "garage/sonar");
        assert_eq!(cfg.broker.host, "10.0.0.5");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.bridge.baud_rate, 115_200);
        assert_eq!(cfg.sensors, vec![SensorConfig::new(7, 2, 3)]);
        assert!((cfg.poll_interval_secs - 0.5).abs() < f64::EPSILON);
        cfg.validate().expect("valid");
    }

    #[test]
    fn only_device_not_ready_is_recoverable() {
        assert!(SonarError::DeviceNotReady("no port".into()).is_recoverable());
        assert!(!SonarError::BridgeConnection("denied".into()).is_recoverable());
        assert!(!SonarError::BrokerConnection("refused".into()).is_recoverable());
        assert!(!SonarError::Configuration("bad".into()).is_recoverable());
        let conflict = SonarError::PinConflict {
            trigger_pin: 4,
            echo_pin: 10,
            details: "bound".into(),
        };
        assert!(!conflict.is_recoverable());
        assert!(conflict.is_channel_local());
    }

    #[test]
    fn sonar_error_display() {
        let err = SonarError::HardwareFault {
            component: "sonar2".to_string(),
            details: "too many sonars".to_string(),
        };
        assert!(err.to_string().contains("sonar2"));
        assert!(
            SonarError::DeviceNotReady("x".into())
                .to_string()
                .contains("Device Not Ready")
        );
    }

    #[test]
    fn fresh_reading_is_sentinel() {
        let r = Reading::default();
        assert!(r.is_sentinel());
        assert_eq!(r.distance_cm, SENTINEL_DISTANCE_CM);
        assert_eq!(SourceType::SonarDistance.firmata_code(), 12);
    }
}
