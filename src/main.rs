use std::{str::FromStr, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use sensor_gateway::{
    bus::{mqtt::MqttTransport, BusClient, BusTransport, ConnectionState},
    cli,
    command::send_command,
    config::Config,
    connector::manager::{ConnectorRegistry, ConnectorsManager},
    logging,
    receiver::{DataReceiver, LatestReadings},
};
use tracing::{debug, info, warn, Level};

/// How long `send-command` waits for the bus.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
async fn hangup() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::hangup())?.recv().await;
    Ok(())
}

#[cfg(windows)]
async fn hangup() -> Result<()> {
    tokio::signal::windows::ctrl_break()?.recv().await;
    Ok(())
}

async fn start_logging(config: &Config) -> Result<()> {
    let level = Level::from_str(&config.logging.level)
        .wrap_err_with(|| format!("Not a log level: {}", config.logging.level))?;
    let file_logging = config.logging.directory.clone().map(|dir| (level, dir));

    logging::init(level, file_logging).await;

    Ok(())
}

async fn run(config: Config, transport: Arc<dyn BusTransport>) -> Result<()> {
    let readings = Arc::new(LatestReadings::new());

    let receiver = DataReceiver::new(&config.bus, transport.clone(), readings.clone())?;
    receiver.start();

    let mut manager = ConnectorsManager::new(config, transport, ConnectorRegistry::builtin());
    manager.start_connectors();

    if manager.connectors().is_empty() {
        warn!("No connector is running");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        hung_up = hangup() => {
            hung_up?;
            info!("Told to hang up, quitting")
        }
    }

    manager.stop();
    receiver.stop();

    manager.join().await;
    receiver.join().await;

    for (sensor, reading) in readings.all() {
        info!(%sensor, value = %reading.value, received = %reading.received, "Last reading");
    }

    Ok(())
}

async fn send(
    config: Config,
    transport: Arc<dyn BusTransport>,
    sensor: &str,
    command: &str,
) -> Result<()> {
    let client = BusClient::publish_only(&config.bus, transport)?;
    client.start();

    let connected = tokio::time::timeout(
        SEND_TIMEOUT,
        client.wait_for_state(ConnectionState::Connected),
    )
    .await;

    let result = match connected {
        Ok(()) => {
            send_command(&client, &sensor.into(), command);
            Ok(())
        }
        Err(_) => Err(eyre!(
            "Could not reach the bus at {}:{}",
            config.bus.host,
            config.bus.port
        )),
    };

    client.stop();
    client.join().await;

    result
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)
            .wrap_err_with(|| format!("Could not use configuration {config_path:?}"))?
    } else {
        Config::default()
    };

    match cli.command {
        Some(cli::Commands::Examples(example)) => cli::show_example(example)?,
        Some(cli::Commands::Devices) => cli::list_devices(&config)?,
        Some(cli::Commands::SendCommand { sensor, command }) => {
            start_logging(&config).await?;

            let transport = Arc::new(MqttTransport::new(&config.bus));
            send(config, transport, &sensor, &command).await?
        }
        None => {
            start_logging(&config).await?;
            debug!(?config, "Configuration");

            let transport = Arc::new(MqttTransport::new(&config.bus));
            run(config, transport).await?
        }
    }

    Ok(())
}
