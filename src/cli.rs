use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    config::Config,
    error::Error,
    serial::{usb::TtyBackend, SerialBackend},
};

/// The command line interface for the sensor gateway.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// List attached USB serial devices, and whether the gateway would use them.
    Devices,

    /// Publish a command for a sensor on the bus.
    SendCommand {
        /// The sensor to address.
        sensor: String,

        /// What to send it. Passed on to the device as is.
        command: String,
    },
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Print an example.
pub fn show_example(example: Examples) -> Result<(), Error> {
    match example {
        Examples::Config => println!("{}", Config::example().serialize_pretty()?),
    }

    Ok(())
}

/// Print the USB serial devices attached to this machine.
pub fn list_devices(config: &Config) -> Result<(), Error> {
    let backend = TtyBackend::new(config.serial.baud);
    let candidates = backend.available()?;

    if candidates.is_empty() {
        println!("No USB serial devices attached");
    }

    for candidate in candidates {
        let supported = if candidate.matches_any(&config.serial.vendor_markers) {
            "supported"
        } else {
            "ignored"
        };

        println!(
            "{:<24} {:<10} {} {}",
            candidate.path,
            supported,
            candidate.manufacturer.as_deref().unwrap_or("-"),
            candidate.product.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
