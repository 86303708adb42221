//! The consuming side of readings published on the bus.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    bus::{BusClient, BusMessage, BusTransport, ConnectionState, MessageHandler},
    config::BusConfig,
    error::Error,
    sensor::SensorId,
    topics,
};

/// Where readings received from the bus end up.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Store a new value of `sensor`.
    async fn register_reading(&self, sensor: SensorId, value: String);
}

struct ReadingHandler {
    sink: Arc<dyn ReadingSink>,
}

#[async_trait]
impl MessageHandler for ReadingHandler {
    async fn handle(&self, message: BusMessage) {
        if !message.topic.starts_with(topics::DATA_PREFIX) {
            warn!(topic = %message.topic, "Not a data topic");
            return;
        }

        let Some(sensor) = topics::sensor_id(&message.topic) else {
            warn!(topic = %message.topic, "Data topic without sensor id");
            return;
        };

        let value = message.payload_lossy();
        debug!(%sensor, %value, "Reading received");

        self.sink.register_reading(sensor, value).await;
    }
}

/// Receives readings from the bus and hands them to a [`ReadingSink`].
#[derive(Debug)]
pub struct DataReceiver {
    client: BusClient,
}

impl DataReceiver {
    /// Create a receiver for readings on [`topics::DATA_PATTERN`].
    pub fn new(
        config: &BusConfig,
        transport: Arc<dyn BusTransport>,
        sink: Arc<dyn ReadingSink>,
    ) -> Result<Self, Error> {
        let client = BusClient::new(
            config,
            transport,
            vec![topics::DATA_PATTERN.to_owned()],
            Arc::new(ReadingHandler { sink }),
        )?;

        Ok(Self { client })
    }

    /// The underlying client, e.g. for sending commands.
    pub fn client(&self) -> &BusClient {
        &self.client
    }

    /// See [`BusClient::start`].
    pub fn start(&self) {
        self.client.start()
    }

    /// See [`BusClient::stop`].
    pub fn stop(&self) {
        self.client.stop()
    }

    /// See [`BusClient::join`].
    pub async fn join(&self) {
        self.client.join().await
    }

    /// See [`BusClient::wait_for_state`].
    pub async fn wait_for_state(&self, wanted: ConnectionState) {
        self.client.wait_for_state(wanted).await
    }
}

/// The last value seen for a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestReading {
    /// The value, as published.
    pub value: String,

    /// When it was received.
    pub received: DateTime<Utc>,
}

/// Keeps the latest value of every sensor heard from.
#[derive(Debug, Default)]
pub struct LatestReadings(Mutex<HashMap<SensorId, LatestReading>>);

impl LatestReadings {
    /// Nothing heard yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest reading of `sensor`, if any.
    pub fn get(&self, sensor: &SensorId) -> Option<LatestReading> {
        self.0.lock().get(sensor).cloned()
    }

    /// Every sensor heard from, with its latest reading.
    pub fn all(&self) -> Vec<(SensorId, LatestReading)> {
        let mut all = self
            .0
            .lock()
            .iter()
            .map(|(sensor, reading)| (sensor.clone(), reading.clone()))
            .collect::<Vec<_>>();

        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }
}

#[async_trait]
impl ReadingSink for LatestReadings {
    async fn register_reading(&self, sensor: SensorId, value: String) {
        self.0.lock().insert(
            sensor,
            LatestReading {
                value,
                received: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::MockBus;

    #[tokio::test]
    async fn latest_value_wins() {
        let readings = LatestReadings::new();
        let before = Utc::now();

        readings.register_reading("A".into(), "1".into()).await;
        readings.register_reading("A".into(), "2".into()).await;
        readings.register_reading("B".into(), "3".into()).await;

        let a = readings.get(&"A".into()).unwrap();
        assert_eq!(a.value, "2");
        assert!(a.received >= before);

        assert_eq!(readings.all().len(), 2);
        assert_eq!(readings.get(&"C".into()), None);
    }

    #[tokio::test]
    async fn readings_from_the_bus_are_registered() {
        let bus = MockBus::new();
        let readings = Arc::new(LatestReadings::new());

        let receiver =
            DataReceiver::new(&BusConfig::default(), bus.transport(), readings.clone()).unwrap();
        receiver.start();
        receiver.wait_for_state(ConnectionState::Connected).await;

        bus.inject("sensors/command/A", "not data");
        bus.inject("sensors/data/A", "21.5");

        let waiting = async {
            while readings.get(&"A".into()).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap();

        receiver.stop();
        receiver.join().await;

        assert_eq!(readings.get(&"A".into()).unwrap().value, "21.5");
        assert_eq!(readings.all().len(), 1);
    }
}
