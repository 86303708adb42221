use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use common::{eventually, fast_config};
use pretty_assertions::assert_eq;
use sensor_gateway::{
    bus::{BusMessage, ConnectionState},
    config::ConnectorEntry,
    connector::{
        manager::{ConnectorFactory, ConnectorRegistry, ConnectorsManager},
        serial::SerialConnector,
        Connector, ConnectorRuntime,
    },
    mock::{MockBackend, MockBus, MockDevice},
};
use tokio::time::timeout;

mod common;

fn registry(backend: &MockBackend) -> ConnectorRegistry {
    let backend = backend.clone();

    let mut registry = ConnectorRegistry::new();
    registry.register(
        "serial",
        ConnectorFactory::new("sensor_gateway::connector::serial", move |config| {
            let connector: Arc<dyn Connector> =
                Arc::new(SerialConnector::new(config, backend.backend()));
            Ok(connector)
        }),
    );

    registry
}

#[tokio::test]
async fn unknown_connectors_are_skipped() -> Result<()> {
    sensor_gateway::logging::init(tracing::Level::DEBUG, None).await;

    let bus = MockBus::new();
    let backend = MockBackend::new();

    let mut config = fast_config();
    config.connectors = vec![
        ConnectorEntry::new("bluetooth"),
        ConnectorEntry {
            implementation: "serial".into(),
            log_level: "trace".into(),
        },
    ];

    let mut manager = ConnectorsManager::new(config, bus.transport(), registry(&backend));
    manager.start_connectors();

    let names = manager
        .connectors()
        .iter()
        .map(ConnectorRuntime::name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["serial"]);

    let device = MockDevice::new(&["SENSOR1"]);
    backend.plug_arduino("/dev/ttyACM0", device.clone());

    let runtime = &manager.connectors()[0];
    runtime.wait_for_bus(ConnectionState::Connected).await;
    eventually("the sensor to be registered", move || async move {
        !runtime.connector().supported_sensors().await.is_empty()
    })
    .await?;

    device.send_data("SENSOR1", "ipsum");
    timeout(Duration::from_secs(5), bus.wait_for_published(1)).await?;

    assert_eq!(
        bus.published(),
        vec![BusMessage::new("sensors/data/SENSOR1", "ipsum")]
    );

    manager.stop();
    manager.join().await;

    assert!(!device.is_open());

    Ok(())
}

#[tokio::test]
async fn no_connectors_configured() -> Result<()> {
    let bus = MockBus::new();

    let mut config = fast_config();
    config.connectors.clear();

    let mut manager = ConnectorsManager::new(config, bus.transport(), ConnectorRegistry::builtin());
    manager.start_connectors();

    assert!(manager.connectors().is_empty());
    assert_eq!(bus.connection_attempts(), 0);

    manager.stop();
    manager.join().await;

    Ok(())
}
