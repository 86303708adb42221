use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

/// Serial port related errors.
pub mod error;

/// The serial port structure.
pub mod serial_port;

/// Enumerating USB attached serial devices.
pub mod usb;

/// Codecs for encoding/decoding messages to/from wire.
pub(crate) mod codecs;

use error::SerialPortError;
pub use usb::UsbCandidate;

/// A line oriented link to a single device.
///
/// Lines are given and returned without their terminating newline.
#[async_trait]
pub trait DevicePort: Send + Debug {
    /// The path the link was opened on.
    fn path(&self) -> &str;

    /// Put a line on the wire.
    async fn write_line(&mut self, line: String) -> Result<(), SerialPortError>;

    /// Wait at most `wait` for the next line.
    /// `Ok(None)` means nothing complete arrived in time.
    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError>;

    /// Is there unread input waiting?
    fn has_pending_input(&mut self) -> Result<bool, SerialPortError>;

    /// Flush and release the link.
    async fn close(&mut self);
}

/// Something able to list attached devices and open links to them.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// List the USB serial devices currently attached.
    fn available(&self) -> Result<Vec<UsbCandidate>, SerialPortError>;

    /// Open a link to the device at `path`.
    async fn open(&self, path: &str) -> Result<Box<dyn DevicePort>, SerialPortError>;
}
