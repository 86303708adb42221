//! Sensor devices attached over USB serial.
//!
//! Devices are found by periodically listing USB serial ports and keeping
//! those whose descriptors carry a known vendor marker.
//! A new device is asked which sensors it carries.
//! It is registered once it has answered, and forgotten when it disappears.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::Connector;
use crate::{
    config::{Config, SerialConfig},
    error::Error,
    protocol::{self, Frame},
    sensor::{Command, Reading, SensorId},
    serial::{error::SerialPortError, usb::TtyBackend, DevicePort, SerialBackend},
};

/// Where this module logs to.
pub(crate) const LOG_TARGET: &str = module_path!();

#[derive(Debug)]
struct Device {
    port: Box<dyn DevicePort>,
    sensors: Vec<SensorId>,
}

/// Registered devices by path.
type Devices = BTreeMap<String, Device>;

/// How asking a device for its sensors went.
#[derive(Debug, PartialEq, Eq)]
enum Handshake {
    /// The device listed these sensors, in the order it declared them.
    Sensors(Vec<SensorId>),

    /// The start marker never showed up.
    NoStart,

    /// The done marker never showed up.
    NoDone,

    /// Told to stop before the device answered.
    Stopped,
}

struct Shared {
    backend: Arc<dyn SerialBackend>,
    config: SerialConfig,
    devices: tokio::sync::Mutex<Devices>,
}

impl Shared {
    async fn handshake(
        &self,
        port: &mut dyn DevicePort,
        shutdown: &CancellationToken,
    ) -> Result<Handshake, SerialPortError> {
        let attempts = self.config.handshake_attempts;
        let timeout = self.config.read_timeout();

        port.write_line(protocol::enumerate_request()).await?;

        let mut started = false;
        for _ in 0..attempts {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Handshake::Stopped),
                line = port.read_line(timeout) => line?,
            };

            match line {
                Some(line) if Frame::parse(&line) == Frame::Start => {
                    started = true;
                    break;
                }
                Some(line) => trace!(%line, "Skipping line while waiting for start"),
                None => trace!("Nothing yet while waiting for start"),
            }
        }

        if !started {
            return Ok(Handshake::NoStart);
        }

        let mut sensors = vec![];
        for _ in 0..attempts {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Handshake::Stopped),
                line = port.read_line(timeout) => line?,
            };

            match line.map(|line| Frame::parse(&line)) {
                Some(Frame::Done) => {
                    return Ok(Handshake::Sensors(sensors.into_iter().unique().collect()))
                }
                Some(Frame::Sensor(sensor)) => {
                    debug!(%sensor, "Sensor declared");
                    sensors.push(sensor);
                }
                Some(frame) => trace!(?frame, "Skipping line while waiting for sensors"),
                None => trace!("Nothing yet while waiting for sensors"),
            }
        }

        Ok(Handshake::NoDone)
    }

    /// Open, settle and ask the device at `path` for its sensors.
    /// The port is returned only if the device answered properly.
    async fn register(&self, path: &str, shutdown: &CancellationToken) -> Option<Device> {
        info!(%path, "Registering device");

        let mut port = match self.backend.open(path).await {
            Ok(port) => port,
            Err(e) => {
                error!(%path, %e, "Could not open device, not registered");
                return None;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(%path, "Stopped while the device was settling");
                port.close().await;
                return None;
            }
            _ = tokio::time::sleep(self.config.settle_delay()) => {}
        }

        match self.handshake(port.as_mut(), shutdown).await {
            Ok(Handshake::Sensors(sensors)) => {
                if sensors.is_empty() {
                    error!(%path, "Device does not declare any sensor");
                }

                Some(Device { port, sensors })
            }
            Ok(Handshake::Stopped) => {
                debug!(%path, "Stopped during handshake");
                port.close().await;
                None
            }
            Ok(failed) => {
                warn!(%path, ?failed, "Device is probably not a supported device");
                port.close().await;
                None
            }
            Err(e) => {
                error!(%path, %e, "Error while registering device, not registered");
                port.close().await;
                None
            }
        }
    }

    async fn discover_once(&self, shutdown: &CancellationToken) -> Result<(), SerialPortError> {
        let found = self
            .backend
            .available()?
            .into_iter()
            .filter(|candidate| candidate.matches_any(&self.config.vendor_markers))
            .map(|candidate| candidate.path)
            .collect::<BTreeSet<_>>();

        trace!(?found, "Discovery pass");

        let new = {
            let devices = self.devices.lock().await;
            found
                .iter()
                .filter(|path| !devices.contains_key(*path))
                .cloned()
                .collect::<Vec<_>>()
        };

        for path in new {
            if shutdown.is_cancelled() {
                break;
            }

            let Some(mut device) = self.register(&path, shutdown).await else {
                continue;
            };

            let mut devices = self.devices.lock().await;

            device.sensors.retain(|sensor| {
                let owner = devices
                    .iter()
                    .find(|(_, other)| other.sensors.contains(sensor));

                match owner {
                    Some((owner, _)) => {
                        warn!(%path, %sensor, %owner, "Sensor already owned by another device, ignoring it");
                        false
                    }
                    None => true,
                }
            });

            info!(%path, sensors = ?device.sensors, "Device registered");
            devices.insert(path, device);
        }

        let mut devices = self.devices.lock().await;

        let gone = devices
            .keys()
            .filter(|path| !found.contains(*path))
            .cloned()
            .collect::<Vec<_>>();

        for path in gone {
            if let Some(mut device) = devices.remove(&path) {
                device.port.close().await;
                info!(%path, "Device unregistered");
            }
        }

        Ok(())
    }

    async fn discover(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.discovery_period();

        loop {
            if let Err(e) = self.discover_once(&shutdown).await {
                error!(%e, "Could not list serial devices");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {},
            }
        }

        debug!("Discovery stopped");
    }
}

/// A connector for sensor devices on USB serial ports.
pub struct SerialConnector {
    shared: Arc<Shared>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl SerialConnector {
    /// A connector finding devices through `backend`.
    pub fn new(config: &Config, backend: Arc<dyn SerialBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                config: config.serial.clone(),
                devices: tokio::sync::Mutex::new(BTreeMap::new()),
            }),
            discovery: Mutex::new(None),
        }
    }

    /// A connector finding devices on the system's serial ports.
    pub fn build(config: &Config) -> Result<Arc<dyn Connector>, Error> {
        Ok(Arc::new(Self::new(
            config,
            Arc::new(TtyBackend::new(config.serial.baud)),
        )))
    }

    /// Do a single discovery pass: register new devices and
    /// drop those which went away.
    pub async fn discover_once(&self) -> Result<(), SerialPortError> {
        self.shared.discover_once(&CancellationToken::new()).await
    }

    /// Paths of the registered devices.
    pub async fn device_paths(&self) -> Vec<String> {
        self.shared.devices.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn supported_sensors(&self) -> BTreeSet<SensorId> {
        self.shared
            .devices
            .lock()
            .await
            .values()
            .flat_map(|device| device.sensors.iter().cloned())
            .collect()
    }

    async fn on_command(&self, command: Command) {
        let mut devices = self.shared.devices.lock().await;

        let Some(device) = devices
            .values_mut()
            .find(|device| device.sensors.contains(&command.sensor))
        else {
            debug!(%command, "No device for sensor");
            return;
        };

        debug!(%command, path = device.port.path(), "Passing command on");

        let line = protocol::sensor_command(&command.sensor, &command.payload);
        if let Err(e) = device.port.write_line(line).await {
            error!(%command, %e, "Could not write command");
        }
    }

    async fn read_data(&self) -> Option<Reading> {
        let mut devices = self.shared.devices.lock().await;
        let timeout = self.shared.config.read_timeout();

        for (path, device) in devices.iter_mut() {
            match device.port.has_pending_input() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(%path, %e, "Could not check for input");
                    return None;
                }
            }

            match device.port.read_line(timeout).await {
                Ok(Some(line)) => {
                    trace!(%path, %line, "Line from device");
                    return protocol::parse_data(&line);
                }
                Ok(None) => trace!(%path, "No complete line, trying the next device"),
                Err(e) => {
                    debug!(%path, %e, "Could not read from device");
                    return None;
                }
            }
        }

        None
    }

    async fn on_start(&self, shutdown: CancellationToken) {
        let span = info_span!("discovery");
        let task = tokio::spawn(self.shared.clone().discover(shutdown).instrument(span));

        *self.discovery.lock() = Some(task);
    }

    async fn on_stop(&self) {
        let task = self.discovery.lock().take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(?e, "Discovery failed");
            }
        }

        let mut devices = self.shared.devices.lock().await;
        for (path, mut device) in std::mem::take(&mut *devices) {
            device.port.close().await;
            debug!(%path, "Device closed");
        }
    }
}
