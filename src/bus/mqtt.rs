use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    bus::{BusMessage, BusSession, BusTransport, Publisher},
    config::BusConfig,
    error::Error,
};

/// Requests (publishes, subscribes) which may be queued towards the event loop.
const REQUEST_CAPACITY: usize = 64;

/// How long to keep driving the event loop to get a disconnect out.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

/// Connects to an MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    host: String,
    port: u16,
    client_id_prefix: String,
    keep_alive: Duration,
}

impl MqttTransport {
    /// A transport towards the broker in `config`.
    pub fn new(config: &BusConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id_prefix: config.client_id_prefix.clone(),
            keep_alive: config.keep_alive(),
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{}.{}", self.client_id_prefix, Uuid::new_v4());

        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        options
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&self) -> Result<Box<dyn BusSession>, Error> {
        debug!(host = %self.host, port = %self.port, "Connecting to MQTT broker");

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }

                    return Err(Error::Bus(format!(
                        "Broker at {}:{} refused the connection: {:?}",
                        self.host, self.port, ack.code
                    )));
                }
                Ok(event) => trace!(?event, "Event while connecting"),
                Err(e) => {
                    return Err(Error::Bus(format!(
                        "Can't connect to broker at {}:{}: {e}",
                        self.host, self.port
                    )))
                }
            }
        }

        Ok(Box::new(MqttSession { client, eventloop }))
    }
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl BusSession for MqttSession {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), Error> {
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| Error::Bus(format!("Could not subscribe: {e}")))
    }

    async fn next_message(&mut self) -> Result<Option<BusMessage>, Error> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(BusMessage::new(publish.topic, publish.payload)));
                }
                Ok(Event::Incoming(Packet::Disconnect))
                | Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(None),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(codes = ?ack.return_codes, "Subscription acknowledged")
                }
                Ok(event) => trace!(?event, "Bus event"),
                Err(e) => return Err(Error::Bus(format!("Connection problem: {e}"))),
            }
        }
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MqttPublisher {
            client: self.client.clone(),
        })
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(%e, "Disconnect request not queued");
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
            debug!("Gave up waiting for disconnect to go out");
        }
    }
}

#[derive(Debug)]
struct MqttPublisher {
    client: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), Error> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| Error::Bus(format!("Could not queue publish: {e}")))
    }
}
