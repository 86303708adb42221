use std::io;

use thiserror::Error;

/// Any error a serial device link might encounter.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),

    /// The port could not be opened.
    #[error("Could not open port at {path}, problem: {problem}")]
    Open {
        /// The path of the port.
        path: String,

        /// What went wrong.
        problem: String,
    },

    /// Serial port disconnected.
    #[error("Serial port disconnected")]
    Disconnected,
}

impl From<tokio_serial::Error> for SerialPortError {
    fn from(e: tokio_serial::Error) -> Self {
        Self::IO(e.into())
    }
}
