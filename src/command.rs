use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    bus::{BusClient, BusMessage, BusTransport, ConnectionState, MessageHandler},
    config::BusConfig,
    error::Error,
    sensor::{Command, SensorId},
    topics,
};

/// Where commands received from the bus end up.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Whether commands for this sensor should be passed on right now.
    async fn is_supported(&self, sensor: &SensorId) -> bool;

    /// Take care of a command for a supported sensor.
    async fn on_command(&self, command: Command);
}

struct CommandHandler {
    sink: Arc<dyn CommandSink>,
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, message: BusMessage) {
        let Some(sensor) = topics::sensor_id(&message.topic) else {
            warn!(topic = %message.topic, "Command topic without sensor id");
            return;
        };

        if !self.sink.is_supported(&sensor).await {
            debug!(%sensor, "Not ours, dropping command");
            return;
        }

        let command = Command {
            sensor,
            payload: message.payload_lossy(),
        };

        debug!(%command, "Command received");
        self.sink.on_command(command).await;
    }
}

/// Receives commands for sensors from the bus, and passes on those a
/// [`CommandSink`] supports.
///
/// Also the channel a connector publishes its readings through.
#[derive(Debug)]
pub struct CommandReceiver {
    client: BusClient,
}

impl CommandReceiver {
    /// Create a receiver for commands on [`topics::COMMAND_PATTERN`].
    pub fn new(
        config: &BusConfig,
        transport: Arc<dyn BusTransport>,
        sink: Arc<dyn CommandSink>,
    ) -> Result<Self, Error> {
        let client = BusClient::new(
            config,
            transport,
            vec![topics::COMMAND_PATTERN.to_owned()],
            Arc::new(CommandHandler { sink }),
        )?;

        Ok(Self { client })
    }

    /// See [`BusClient::start`].
    pub fn start(&self) {
        self.client.start()
    }

    /// See [`BusClient::publish`].
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        self.client.publish(topic, payload)
    }

    /// See [`BusClient::stop`].
    pub fn stop(&self) {
        self.client.stop()
    }

    /// See [`BusClient::join`].
    pub async fn join(&self) {
        self.client.join().await
    }

    /// See [`BusClient::state`].
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// See [`BusClient::wait_for_state`].
    pub async fn wait_for_state(&self, wanted: ConnectionState) {
        self.client.wait_for_state(wanted).await
    }
}

/// Publish a command for `sensor` on its command topic.
pub fn send_command(bus: &BusClient, sensor: &SensorId, command: &str) {
    debug!(%sensor, %command, "Sending command");
    bus.publish(&topics::command_topic(sensor), command.to_owned());
}
