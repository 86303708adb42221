//! Connectors bridge one kind of device to the bus.
//!
//! A [`Connector`] only has to know its devices: which sensors they carry,
//! how to read from them and how to pass commands on.
//! The [`ConnectorRuntime`] takes care of the rest: polling the connector for
//! readings, publishing them, and routing commands from the bus back to it.

use std::{collections::BTreeSet, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    bus::{BusTransport, ConnectionState},
    command::{CommandReceiver, CommandSink},
    config::Config,
    error::Error,
    sensor::{Command, Reading, SensorId},
    topics,
};

/// Starting connectors named in the configuration.
pub mod manager;

/// Sensor devices on USB serial ports.
pub mod serial;

/// The capabilities of a connector.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The sensors this connector can currently reach.
    async fn supported_sensors(&self) -> BTreeSet<SensorId>;

    /// Pass a command on to the sensor it is addressed to.
    async fn on_command(&self, command: Command);

    /// A reading, if any device has one ready.
    async fn read_data(&self) -> Option<Reading>;

    /// Called once before the connector is first polled.
    /// Background work started here must end when `shutdown` is cancelled.
    async fn on_start(&self, _shutdown: CancellationToken) {}

    /// Called once after the connector was last polled.
    async fn on_stop(&self) {}
}

struct ConnectorSink(Arc<dyn Connector>);

#[async_trait]
impl CommandSink for ConnectorSink {
    async fn is_supported(&self, sensor: &SensorId) -> bool {
        self.0.supported_sensors().await.contains(sensor)
    }

    async fn on_command(&self, command: Command) {
        self.0.on_command(command).await
    }
}

/// A connector, with what it needs to run.
pub struct ConnectorRuntime {
    name: String,
    connector: Arc<dyn Connector>,
    receiver: Arc<CommandReceiver>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for ConnectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRuntime")
            .field("name", &self.name)
            .field("receiver", &self.receiver)
            .finish()
    }
}

impl ConnectorRuntime {
    /// Prepare `connector` for running.
    /// Nothing happens until [`ConnectorRuntime::start`] is called.
    pub fn new(
        name: &str,
        connector: Arc<dyn Connector>,
        transport: Arc<dyn BusTransport>,
        config: &Config,
    ) -> Result<Self, Error> {
        let receiver = CommandReceiver::new(
            &config.bus,
            transport,
            Arc::new(ConnectorSink(connector.clone())),
        )?;

        Ok(Self {
            name: name.into(),
            connector,
            receiver: Arc::new(receiver),
            poll_interval: config.poll_interval(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Start receiving commands, and start polling the connector.
    pub fn start(&self) {
        let mut task = self.task.lock();

        if task.is_some() {
            debug!(name = %self.name, "Connector already started");
            return;
        }

        info!(name = %self.name, "Starting connector");
        self.receiver.start();

        let span = info_span!("connector", name = %self.name);
        *task = Some(tokio::spawn(
            poll(
                self.connector.clone(),
                self.receiver.clone(),
                self.poll_interval,
                self.shutdown.clone(),
            )
            .instrument(span),
        ));
    }

    /// Ask the polling and the command receiver to stop.
    pub fn stop(&self) {
        debug!(name = %self.name, "Stopping connector");
        self.shutdown.cancel();
        self.receiver.stop();
    }

    /// Wait until polling and the command receiver have stopped.
    pub async fn join(&self) {
        let task = self.task.lock().take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(name = %self.name, ?e, "Connector polling failed");
            }
        }

        self.receiver.join().await;
        info!(name = %self.name, "Connector stopped");
    }

    /// The name the connector was started under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connector itself.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The connection state of the command receiver.
    pub fn bus_state(&self) -> ConnectionState {
        self.receiver.state()
    }

    /// Wait until the command receiver is in the `wanted` state.
    pub async fn wait_for_bus(&self, wanted: ConnectionState) {
        self.receiver.wait_for_state(wanted).await
    }
}

async fn poll(
    connector: Arc<dyn Connector>,
    receiver: Arc<CommandReceiver>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    connector.on_start(shutdown.clone()).await;

    while !shutdown.is_cancelled() {
        if let Some(reading) = connector.read_data().await {
            debug!(%reading, "Publishing reading");
            receiver.publish(&topics::data_topic(&reading.sensor), reading.value);
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }

    connector.on_stop().await;
    debug!("Polling done");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{bus::BusMessage, mock::MockBus};

    #[derive(Default)]
    struct Basic {
        reads: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicBool,
        commands: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl Connector for Basic {
        async fn supported_sensors(&self) -> BTreeSet<SensorId> {
            ["A", "B", "C"].into_iter().map(SensorId::from).collect()
        }

        async fn on_command(&self, command: Command) {
            self.commands.lock().push(command);
        }

        async fn read_data(&self) -> Option<Reading> {
            match self.reads.fetch_add(1, Ordering::SeqCst) {
                0 => Some(Reading::new("A", "my-data")),
                _ => None,
            }
        }

        async fn on_start(&self, _shutdown: CancellationToken) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn runtime(bus: &MockBus, connector: Arc<Basic>) -> ConnectorRuntime {
        ConnectorRuntime::new("basic", connector, bus.transport(), &Config::default()).unwrap()
    }

    #[tokio::test]
    async fn start_stop() {
        let bus = MockBus::new();
        let connector = Arc::new(Basic::default());
        let runtime = runtime(&bus, connector.clone());

        runtime.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.stop();
        runtime.join().await;

        assert_eq!(connector.started.load(Ordering::SeqCst), 1);
        assert!(connector.stopped.load(Ordering::SeqCst));
        assert!(connector.reads.load(Ordering::SeqCst) > 1);
        assert_eq!(runtime.bus_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn readings_are_published() {
        let bus = MockBus::new();
        let runtime = runtime(&bus, Arc::new(Basic::default()));

        runtime.start();
        bus.wait_for_published(1).await;
        runtime.stop();
        runtime.join().await;

        assert_eq!(
            bus.published(),
            vec![BusMessage::new("sensors/data/A", "my-data")]
        );
    }

    #[tokio::test]
    async fn commands_reach_the_connector() {
        let bus = MockBus::new();
        let connector = Arc::new(Basic::default());
        let runtime = runtime(&bus, connector.clone());

        runtime.start();
        runtime.wait_for_bus(ConnectionState::Connected).await;

        bus.inject("sensors/command/A", "my-command");
        bus.inject("sensors/command/Z", "not for us");

        let waiting = async {
            while connector.commands.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap();

        runtime.stop();
        runtime.join().await;

        assert_eq!(
            *connector.commands.lock(),
            vec![Command::new("A", "my-command")]
        );
    }
}
