use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::{debug, trace, warn};

use crate::serial::{codecs::lines::LinesCodec, error::SerialPortError, DevicePort};

/// Builder for a [`SerialPortHandle`].
#[derive(Debug, Default)]
pub struct SerialPortBuilder {
    baud: Option<u32>,
    path: String,
}

impl SerialPortBuilder {
    /// Start a new builder.
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub fn new(tty: &str) -> Self {
        Self {
            path: tty.to_string(),
            ..Default::default()
        }
    }

    /// Set the serial port builder's baud.
    /// Will use 9600 if not set.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Open the port.
    pub fn build(self) -> Result<SerialPortHandle, SerialPortError> {
        let baud = self.baud.unwrap_or(9600);
        debug!(%self.path, %baud, "Opening port");

        let serial_stream = tokio_serial::new(&self.path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| SerialPortError::Open {
                path: self.path.clone(),
                problem: e.to_string(),
            })?;

        Ok(SerialPortHandle {
            tty: self.path,
            framed: LinesCodec::default().framed(serial_stream),
        })
    }
}

/// An open tty, framed into lines.
#[derive(Debug)]
pub struct SerialPortHandle {
    tty: String,
    framed: Framed<SerialStream, LinesCodec>,
}

#[async_trait]
impl DevicePort for SerialPortHandle {
    fn path(&self) -> &str {
        &self.tty
    }

    async fn write_line(&mut self, line: String) -> Result<(), SerialPortError> {
        trace!(tty = %self.tty, %line, "To wire");
        self.framed.send(line).await
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(SerialPortError::Disconnected),
            Ok(Some(line)) => {
                let line = line?;
                trace!(tty = %self.tty, %line, "From wire");
                Ok(Some(line))
            }
        }
    }

    fn has_pending_input(&mut self) -> Result<bool, SerialPortError> {
        if self.framed.codec().has_line(self.framed.read_buffer()) {
            return Ok(true);
        }

        Ok(self.framed.get_ref().bytes_to_read()? > 0)
    }

    async fn close(&mut self) {
        if let Err(e) = self.framed.close().await {
            warn!(tty = %self.tty, ?e, "Problem flushing port on close");
        }
    }
}
