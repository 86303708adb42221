#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use sensor_gateway::{
    config::Config,
    connector::{serial::SerialConnector, ConnectorRuntime},
    mock::{MockBackend, MockBus},
};
use tokio::time::timeout;
use tracing::Level;

/// A configuration making discovery and handshakes quick.
pub fn fast_config() -> Config {
    let mut config = Config::default();

    config.bus.retry_interval_ms = 10;
    config.serial.settle_delay_ms = 0;
    config.serial.read_timeout_ms = 20;
    config.serial.discovery_period_ms = 20;

    config
}

/// A serial connector running against an in-memory bus and in-memory devices.
pub struct Gateway {
    pub bus: MockBus,
    pub backend: MockBackend,
    pub runtime: ConnectorRuntime,
}

impl Gateway {
    pub async fn start() -> Result<Self> {
        sensor_gateway::logging::init(Level::DEBUG, None).await;

        let config = fast_config();
        let bus = MockBus::new();
        let backend = MockBackend::new();

        let connector = Arc::new(SerialConnector::new(&config, backend.backend()));
        let runtime = ConnectorRuntime::new("serial", connector, bus.transport(), &config)?;
        runtime.start();

        Ok(Self {
            bus,
            backend,
            runtime,
        })
    }

    pub async fn stop(self) {
        self.runtime.stop();
        self.runtime.join().await;
    }
}

/// Poll `condition` until it holds, for at most five seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waiting = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    timeout(Duration::from_secs(5), waiting)
        .await
        .map_err(|_| eyre!("Timed out waiting for: {what}"))
}
