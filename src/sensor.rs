use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The identifier a device declares for one of its sensors.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Deserialize, Serialize)]
pub struct SensorId(String);

impl SensorId {
    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: AsRef<str>> From<T> for SensorId {
    fn from(string_like: T) -> Self {
        Self(string_like.as_ref().into())
    }
}

impl Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value read from a sensor.
/// Handed to the bus right away, never kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// The sensor which produced the value.
    pub sensor: SensorId,

    /// The raw value, opaque to the gateway.
    pub value: String,
}

impl Reading {
    /// Create a new reading.
    pub fn new(sensor: impl Into<SensorId>, value: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            value: value.into(),
        }
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = self.value.chars().take(48).collect::<String>();

        write!(f, "{}: {}", self.sensor, value.trim())
    }
}

/// A command for a sensor, as received from the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The sensor the command is addressed to.
    pub sensor: SensorId,

    /// The raw command, opaque to the gateway.
    pub payload: String,
}

impl Command {
    /// Create a new command.
    pub fn new(sensor: impl Into<SensorId>, payload: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            payload: payload.into(),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <- {}", self.sensor, self.payload)
    }
}
