use std::{path::Path, path::PathBuf, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Where the bus is, and how to behave towards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Each session gets a client id of this prefix and a random suffix.
    pub client_id_prefix: String,

    /// Keep alive interval towards the broker.
    pub keep_alive_secs: u64,

    /// How long to wait between connection attempts.
    /// Attempts never stop.
    pub retry_interval_ms: u64,

    /// How many inbound messages may be handled at the same time.
    pub pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id_prefix: "sensor-gateway".into(),
            keep_alive_secs: 60,
            retry_interval_ms: 1000,
            pool_size: 10,
        }
    }
}

impl BusConfig {
    /// See [`BusConfig::retry_interval_ms`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// See [`BusConfig::keep_alive_secs`].
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// A connector to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorEntry {
    /// The name the implementation is registered under.
    pub implementation: String,

    /// Verbosity of the implementation's logs, e.g. `"debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl ConnectorEntry {
    /// A connector entry logging at info level.
    pub fn new(implementation: &str) -> Self {
        Self {
            implementation: implementation.into(),
            log_level: default_log_level(),
        }
    }
}

/// How the serial connector finds and talks to devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate devices are opened with.
    pub baud: u32,

    /// A device is supported if any of its USB descriptors
    /// contains one of these, ignoring case.
    pub vendor_markers: Vec<String>,

    /// Time between two discovery passes.
    pub discovery_period_ms: u64,

    /// Time given to a device to boot after opening it,
    /// before asking for its sensors.
    pub settle_delay_ms: u64,

    /// How many lines to read while waiting for each handshake marker.
    pub handshake_attempts: usize,

    /// How long a single line read may wait.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 9600,
            vendor_markers: vec!["arduino".into()],
            discovery_period_ms: 5000,
            settle_delay_ms: 5000,
            handshake_attempts: 10,
            read_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    /// See [`SerialConfig::discovery_period_ms`].
    pub fn discovery_period(&self) -> Duration {
        Duration::from_millis(self.discovery_period_ms)
    }

    /// See [`SerialConfig::settle_delay_ms`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// See [`SerialConfig::read_timeout_ms`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Where logs go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level of logs on stdout, unless `RUST_LOG` says otherwise.
    pub level: String,

    /// If set, logs are also written to daily rotated files in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
        }
    }
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// See [`BusConfig`].
    pub bus: BusConfig,

    /// The connectors to start, in order.
    pub connectors: Vec<ConnectorEntry>,

    /// Pause between two polls of a connector for data.
    pub poll_interval_ms: u64,

    /// See [`SerialConfig`].
    pub serial: SerialConfig,

    /// See [`LoggingConfig`].
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            connectors: vec![ConnectorEntry::new("serial")],
            poll_interval_ms: 10,
            serial: SerialConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            bus: BusConfig {
                host: "192.168.1.10".into(),
                ..Default::default()
            },
            connectors: vec![ConnectorEntry {
                implementation: "serial".into(),
                log_level: "debug".into(),
            }],
            serial: SerialConfig {
                vendor_markers: vec!["arduino".into(), "wch.cn".into()],
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".into(),
                directory: Some("/var/log/sensor-gateway".into()),
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(p)?;

        let config = Self::deserialize(&s)?;
        config.validate()?;

        Ok(config)
    }

    /// See [`Config::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn check_bus(&self) -> Result<(), Error> {
        if self.bus.host.is_empty() {
            return Err(Error::BadConfig("The bus host is empty".into()));
        }

        if self.bus.pool_size == 0 {
            return Err(Error::BadConfig(
                "The bus pool size must allow at least one message handler".into(),
            ));
        }

        Ok(())
    }

    fn check_connectors(&self) -> Result<(), Error> {
        if let Some(index) = self
            .connectors
            .iter()
            .position(|entry| entry.implementation.is_empty())
        {
            return Err(Error::BadConfig(format!(
                "The connector with index {index} (zero indexed) has no implementation name"
            )));
        }

        let duplicates = self
            .connectors
            .iter()
            .map(|entry| &entry.implementation)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Each connector may only be started once. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_serial(&self) -> Result<(), Error> {
        if self.serial.handshake_attempts == 0 {
            return Err(Error::BadConfig(
                "The serial handshake needs at least one attempt".into(),
            ));
        }

        Ok(())
    }

    /// Check the configuration for values which can't work.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_bus()?;
        self.check_connectors()?;
        self.check_serial()?;

        Ok(())
    }
}
