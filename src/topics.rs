//! Bus topics shared with the platform core.

use crate::sensor::SensorId;

/// Readings are published below this prefix, one topic per sensor.
pub const DATA_PREFIX: &str = "sensors/data";

/// Commands are received below this prefix, one topic per sensor.
pub const COMMAND_PREFIX: &str = "sensors/command";

/// Matches the topic of every sensor's readings.
pub const DATA_PATTERN: &str = "sensors/data/#";

/// Matches the topic of every sensor's commands.
pub const COMMAND_PATTERN: &str = "sensors/command/+";

/// Where readings of this sensor are published.
pub fn data_topic(sensor: &SensorId) -> String {
    format!("{DATA_PREFIX}/{sensor}")
}

/// Where commands for this sensor are published.
pub fn command_topic(sensor: &SensorId) -> String {
    format!("{COMMAND_PREFIX}/{sensor}")
}

/// The last level of a topic, which is where the sensor id lives.
pub fn sensor_id(topic: &str) -> Option<SensorId> {
    match topic.rsplit('/').next() {
        Some(last) if !last.is_empty() => Some(last.into()),
        _ => None,
    }
}

/// Whether a topic matches a subscription filter,
/// where `+` matches exactly one level and a trailing `#` matches any remaining levels.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
