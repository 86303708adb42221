use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use common::{eventually, Gateway};
use pretty_assertions::assert_eq;
use sensor_gateway::{
    bus::{BusMessage, ConnectionState},
    command::send_command,
    config::BusConfig,
    mock::MockDevice,
    receiver::{DataReceiver, LatestReadings},
    sensor::SensorId,
};
use tokio::time::timeout;
use tracing::info;

mod common;

async fn plug_sensor(gateway: &Gateway, path: &str, sensors: &[&str]) -> Result<MockDevice> {
    let device = MockDevice::new(sensors);
    gateway.backend.plug_arduino(path, device.clone());

    let wanted = &sensors.iter().map(SensorId::from).collect::<Vec<_>>();
    eventually("sensors to be registered", move || async move {
        let supported = gateway.runtime.connector().supported_sensors().await;
        wanted.iter().all(|sensor| supported.contains(sensor))
    })
    .await?;

    Ok(device)
}

#[tokio::test]
async fn readings_are_published() -> Result<()> {
    let gateway = Gateway::start().await?;
    let device = plug_sensor(&gateway, "/dev/ttyACM0", &["SENSOR1"]).await?;

    gateway
        .runtime
        .wait_for_bus(ConnectionState::Connected)
        .await;

    device.send_data("SENSOR1", "ipsum");
    timeout(Duration::from_secs(5), gateway.bus.wait_for_published(1)).await?;

    assert_eq!(
        gateway.bus.published(),
        vec![BusMessage::new("sensors/data/SENSOR1", "ipsum")]
    );

    gateway.stop().await;

    Ok(())
}

#[tokio::test]
async fn commands_reach_the_device() -> Result<()> {
    let gateway = Gateway::start().await?;
    let device = plug_sensor(&gateway, "/dev/ttyACM0", &["SENSOR1"]).await?;

    gateway
        .runtime
        .wait_for_bus(ConnectionState::Connected)
        .await;

    gateway.bus.inject("sensors/command/SENSOR1", "foo");

    let expected = &"COMMAND/:/SENSOR/:/SENSOR1/:/foo".to_owned();
    let device = &device;
    eventually("the command to be written", move || async move {
        device.written().contains(expected)
    })
    .await?;

    gateway.stop().await;

    Ok(())
}

#[tokio::test]
async fn many_readings_keep_their_order() -> Result<()> {
    let gateway = Gateway::start().await?;
    let device = plug_sensor(&gateway, "/dev/ttyACM0", &["SENSOR1", "SENSOR2"]).await?;

    gateway
        .runtime
        .wait_for_bus(ConnectionState::Connected)
        .await;

    let words = lipsum::lipsum_from_seed(50, 123)
        .split_ascii_whitespace()
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();

    for (index, word) in words.iter().enumerate() {
        let sensor = if index % 2 == 0 { "SENSOR1" } else { "SENSOR2" };
        device.send_data(sensor, word);
    }

    info!(words = words.len(), "Waiting for readings");
    timeout(
        Duration::from_secs(10),
        gateway.bus.wait_for_published(words.len()),
    )
    .await?;

    let values = gateway
        .bus
        .published()
        .into_iter()
        .map(|message| message.payload_lossy())
        .collect::<Vec<_>>();
    assert_eq!(values, words);

    gateway.stop().await;

    Ok(())
}

#[tokio::test]
async fn unplugged_sensors_get_no_commands() -> Result<()> {
    let gateway = Gateway::start().await?;
    let device = plug_sensor(&gateway, "/dev/ttyACM0", &["SENSOR1"]).await?;

    gateway
        .runtime
        .wait_for_bus(ConnectionState::Connected)
        .await;

    gateway.backend.unplug("/dev/ttyACM0");
    let watched = &gateway;
    eventually("the device to be dropped", move || async move {
        watched
            .runtime
            .connector()
            .supported_sensors()
            .await
            .is_empty()
    })
    .await?;
    assert!(!device.is_open());

    let written = device.written().len();
    gateway.bus.inject("sensors/command/SENSOR1", "foo");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(device.written().len(), written);

    gateway.stop().await;

    Ok(())
}

#[tokio::test]
async fn readings_and_commands_between_clients() -> Result<()> {
    let gateway = Gateway::start().await?;
    let device = plug_sensor(&gateway, "/dev/ttyACM0", &["SENSOR1"]).await?;

    let readings = Arc::new(LatestReadings::new());
    let receiver = DataReceiver::new(
        &BusConfig::default(),
        gateway.bus.transport(),
        readings.clone(),
    )?;
    receiver.start();
    receiver.wait_for_state(ConnectionState::Connected).await;
    gateway
        .runtime
        .wait_for_bus(ConnectionState::Connected)
        .await;

    device.send_data("SENSOR1", "21.5");
    let readings = &readings;
    eventually("the reading to arrive", move || async move {
        readings.get(&"SENSOR1".into()).is_some()
    })
    .await?;
    assert_eq!(readings.get(&"SENSOR1".into()).unwrap().value, "21.5");

    send_command(receiver.client(), &"SENSOR1".into(), "reset");

    let expected = &"COMMAND/:/SENSOR/:/SENSOR1/:/reset".to_owned();
    let device = &device;
    eventually("the command to be written", move || async move {
        device.written().contains(expected)
    })
    .await?;

    receiver.stop();
    receiver.join().await;
    gateway.stop().await;

    Ok(())
}
