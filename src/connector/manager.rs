use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use tracing::{error, info, warn, Level};

use super::{
    serial::{self, SerialConnector},
    Connector, ConnectorRuntime,
};
use crate::{bus::BusTransport, config::Config, error::Error, logging};

type Build = dyn Fn(&Config) -> Result<Arc<dyn Connector>, Error> + Send + Sync;

/// How to build a connector.
#[derive(Clone)]
pub struct ConnectorFactory {
    /// Logging target of the implementation, i.e. its module path.
    /// The configured log level of the connector applies to this target.
    pub target: &'static str,

    build: Arc<Build>,
}

impl ConnectorFactory {
    /// A factory using `build` to create connectors logging under `target`.
    pub fn new<F>(target: &'static str, build: F) -> Self
    where
        F: Fn(&Config) -> Result<Arc<dyn Connector>, Error> + Send + Sync + 'static,
    {
        Self {
            target,
            build: Arc::new(build),
        }
    }

    /// Build a connector from the gateway configuration.
    pub fn build(&self, config: &Config) -> Result<Arc<dyn Connector>, Error> {
        (self.build)(config)
    }
}

impl std::fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// The connector implementations which may be named in the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    factories: BTreeMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// A registry without any connectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// The connectors shipped with the gateway.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            "serial",
            ConnectorFactory::new(serial::LOG_TARGET, SerialConnector::build),
        );

        registry
    }

    /// Make a connector available under `name`.
    /// Replaces any connector already registered under that name.
    pub fn register(&mut self, name: &str, factory: ConnectorFactory) {
        if self.factories.insert(name.into(), factory).is_some() {
            warn!(%name, "Replaced registered connector");
        }
    }

    /// The factory registered under `name`.
    pub fn get(&self, name: &str) -> Option<&ConnectorFactory> {
        self.factories.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Starts and stops the connectors a [`Config`] names.
pub struct ConnectorsManager {
    config: Config,
    transport: Arc<dyn BusTransport>,
    registry: ConnectorRegistry,
    connectors: Vec<ConnectorRuntime>,
}

impl std::fmt::Debug for ConnectorsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorsManager")
            .field("registry", &self.registry)
            .field("connectors", &self.connectors)
            .finish_non_exhaustive()
    }
}

impl ConnectorsManager {
    /// A manager which builds connectors from `registry`,
    /// each with its own bus session through `transport`.
    pub fn new(
        config: Config,
        transport: Arc<dyn BusTransport>,
        registry: ConnectorRegistry,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            connectors: vec![],
        }
    }

    /// Start every connector named in the configuration, in order.
    ///
    /// Entries naming an unknown implementation, or whose connector can't be built,
    /// are logged and skipped.
    pub fn start_connectors(&mut self) {
        for entry in &self.config.connectors {
            let name = &entry.implementation;

            if self.connectors.iter().any(|running| running.name() == name) {
                warn!(%name, "Connector already running");
                continue;
            }

            let Some(factory) = self.registry.get(name) else {
                let e = Error::UnknownConnector(name.clone());
                error!(
                    %e,
                    known = ?self.registry.names().collect::<Vec<_>>(),
                    "Skipping connector"
                );
                continue;
            };

            match Level::from_str(&entry.log_level) {
                Ok(level) => logging::set_target_level(factory.target, level),
                Err(_) => {
                    warn!(%name, level = %entry.log_level, "Not a log level, keeping the default")
                }
            }

            let runtime = factory.build(&self.config).and_then(|connector| {
                ConnectorRuntime::new(name, connector, self.transport.clone(), &self.config)
            });

            match runtime {
                Ok(runtime) => {
                    runtime.start();
                    self.connectors.push(runtime);
                    info!(%name, "Connector started");
                }
                Err(e) => error!(%name, %e, "Could not build connector, skipping it"),
            }
        }
    }

    /// The running connectors, in start order.
    pub fn connectors(&self) -> &[ConnectorRuntime] {
        &self.connectors
    }

    /// Ask all running connectors to stop.
    pub fn stop(&self) {
        for connector in &self.connectors {
            connector.stop();
        }
    }

    /// Wait for all connectors to stop.
    pub async fn join(&self) {
        for connector in &self.connectors {
            connector.join().await;
        }
    }
}
