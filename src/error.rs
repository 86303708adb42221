use std::io;

use thiserror::Error;

use crate::serial::error::SerialPortError;

/// Errors thay may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration can not be used as-is.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Problem talking to the bus.
    #[error("Bus problem: {0}")]
    Bus(String),

    /// No connector implementation is registered under this name.
    #[error("The connector `{0}` is not known")]
    UnknownConnector(String),

    /// A serial port misbehaved.
    #[error("Serial port problem")]
    Serial(#[from] SerialPortError),

    /// IO related errors, such as reading a configuration file.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),
}

impl Error {
    /// Get the message of a [`Error::BadConfig`], or the error back if it was something else.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}
