//! The line protocol spoken by sensor devices.
//!
//! Every frame is one line of ASCII text, with fields separated by [`SEPARATOR`].
//!
//! | Frame                  | Sender           | Form                                  |
//! |------------------------|------------------|---------------------------------------|
//! | Enumerate request      | gateway → device | `COMMAND/:/SENSORS`                   |
//! | Enumerate start marker | device → gateway | `***START***`                         |
//! | Sensor declaration     | device → gateway | `SENSOR/:/<id>`                       |
//! | Enumerate end marker   | device → gateway | `***DONE***`                          |
//! | Data report            | device → gateway | `DATA/:/<id>/:/<value>`               |
//! | Sensor command         | gateway → device | `COMMAND/:/SENSOR/:/<id>/:/<command>` |

use crate::sensor::{Reading, SensorId};

/// Separates the fields of a frame.
pub const SEPARATOR: &str = "/:/";

/// Sent by a device before it lists its sensors.
pub const START_MARKER: &str = "***START***";

/// Sent by a device after it has listed its sensors.
pub const DONE_MARKER: &str = "***DONE***";

const SENSOR: &str = "SENSOR";
const DATA: &str = "DATA";
const COMMAND: &str = "COMMAND";
const SENSORS: &str = "SENSORS";

/// A line received from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// [`START_MARKER`].
    Start,

    /// [`DONE_MARKER`].
    Done,

    /// The device has this sensor.
    Sensor(SensorId),

    /// A sensor reported a value.
    Data(Reading),

    /// Anything else, such as debug output from the device.
    Other(String),
}

impl Frame {
    /// Interpret a line (without its newline).
    pub fn parse(line: &str) -> Self {
        match line {
            START_MARKER => return Self::Start,
            DONE_MARKER => return Self::Done,
            _ => {}
        }

        let mut fields = line.splitn(3, SEPARATOR);

        match (fields.next(), fields.next(), fields.next()) {
            (Some(SENSOR), Some(id), _) if !id.is_empty() => Self::Sensor(id.into()),
            (Some(DATA), Some(id), Some(value)) if !id.is_empty() => {
                Self::Data(Reading::new(id, value))
            }
            _ => Self::Other(line.to_owned()),
        }
    }
}

/// Ask a device to list its sensors.
pub fn enumerate_request() -> String {
    format!("{COMMAND}{SEPARATOR}{SENSORS}")
}

/// Pass a command on to one sensor of a device.
pub fn sensor_command(sensor: &SensorId, command: &str) -> String {
    format!("{COMMAND}{SEPARATOR}{SENSOR}{SEPARATOR}{sensor}{SEPARATOR}{command}")
}

/// Parse a data report line, if it is one.
pub fn parse_data(line: &str) -> Option<Reading> {
    match Frame::parse(line) {
        Frame::Data(reading) => Some(reading),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_line() {
        assert_eq!(parse_data("DATA/:/S1/:/42"), Some(Reading::new("S1", "42")));
    }

    #[test]
    fn data_value_keeps_separators() {
        assert_eq!(
            parse_data("DATA/:/S1/:/a/:/b"),
            Some(Reading::new("S1", "a/:/b"))
        );
    }

    #[test]
    fn non_data_lines_yield_nothing() {
        for line in [
            "",
            "hello",
            "DATA/:/S1",
            "DATA/://:/42",
            "SENSOR/:/S1",
            "data/:/S1/:/42",
            "XDATA/:/S1/:/42",
            START_MARKER,
        ] {
            assert_eq!(parse_data(line), None, "{line}");
        }
    }

    #[test]
    fn handshake_frames() {
        assert_eq!(Frame::parse("***START***"), Frame::Start);
        assert_eq!(Frame::parse("***DONE***"), Frame::Done);
        assert_eq!(Frame::parse("SENSOR/:/TEMP1"), Frame::Sensor("TEMP1".into()));
        assert_eq!(
            Frame::parse("SENSOR/:/"),
            Frame::Other("SENSOR/:/".to_owned())
        );
        assert_eq!(
            Frame::parse("booting..."),
            Frame::Other("booting...".to_owned())
        );
    }

    #[test]
    fn outgoing_frames() {
        assert_eq!(enumerate_request(), "COMMAND/:/SENSORS");
        assert_eq!(
            sensor_command(&"SENSOR1".into(), "foo"),
            "COMMAND/:/SENSOR/:/SENSOR1/:/foo"
        );
    }
}
