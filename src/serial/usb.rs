use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortType;
use tracing::trace;

use crate::serial::{
    error::SerialPortError, serial_port::SerialPortBuilder, DevicePort, SerialBackend,
};

/// A USB attached serial device, as seen during enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbCandidate {
    /// Where to open it, e.g. `/dev/ttyACM0`.
    pub path: String,

    /// Manufacturer descriptor string.
    pub manufacturer: Option<String>,

    /// Product descriptor string.
    pub product: Option<String>,

    /// Serial number descriptor string.
    pub serial_number: Option<String>,
}

impl UsbCandidate {
    /// A candidate with only a path.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the manufacturer descriptor.
    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set the product descriptor.
    pub fn with_product(mut self, product: &str) -> Self {
        self.product = Some(product.into());
        self
    }

    fn descriptors(&self) -> impl Iterator<Item = &str> {
        [&self.manufacturer, &self.product, &self.serial_number]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .chain(std::iter::once(self.path.as_str()))
    }

    /// Whether any descriptor contains any of the markers, ignoring case.
    pub fn matches_any<S: AsRef<str>>(&self, markers: &[S]) -> bool {
        self.descriptors().any(|descriptor| {
            let descriptor = descriptor.to_lowercase();

            markers
                .iter()
                .any(|marker| descriptor.contains(&marker.as_ref().to_lowercase()))
        })
    }
}

/// Real ttys, found through the platform's port enumeration.
#[derive(Debug, Clone)]
pub struct TtyBackend {
    baud: u32,
}

impl TtyBackend {
    /// Ports will be opened with the given baud rate.
    pub fn new(baud: u32) -> Self {
        Self { baud }
    }
}

#[async_trait]
impl SerialBackend for TtyBackend {
    fn available(&self) -> Result<Vec<UsbCandidate>, SerialPortError> {
        let ports = tokio_serial::available_ports()?;

        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) => {
                    trace!(port = %port.port_name, ?info, "USB port");

                    Some(UsbCandidate {
                        path: port.port_name,
                        manufacturer: info.manufacturer,
                        product: info.product,
                        serial_number: info.serial_number,
                    })
                }
                _ => None,
            })
            .collect())
    }

    async fn open(&self, path: &str) -> Result<Box<dyn DevicePort>, SerialPortError> {
        let port = SerialPortBuilder::new(path).set_baud(self.baud).build()?;

        Ok(Box::new(port))
    }
}
