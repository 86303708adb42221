#![deny(missing_docs)]

//! A gateway between USB serial sensor devices and a message bus.
//!
//! Connectors find devices and learn which sensors they carry.
//! Readings from those sensors are published on `sensors/data/<sensor>`,
//! and commands published on `sensors/command/<sensor>` are passed on to the
//! device carrying that sensor.
//!
//! Without a broker or hardware around, [`mock`] provides in-memory stand-ins
//! for both.

/// Staying connected to the bus, and handling what arrives.
pub mod bus;

/// Commands for sensors, from the bus to connectors.
pub mod command;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Connectors, their runtime and the manager starting them.
pub mod connector;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// Mocked bus and serial devices.
pub mod mock;

/// The line protocol spoken by sensor devices.
pub mod protocol;

/// Readings, from the bus to whoever stores them.
pub mod receiver;

/// Sensors, their readings and commands.
pub mod sensor;

/// Serial port driver.
pub mod serial;

/// Bus topic naming.
pub mod topics;
