//! A resilient connection to the message bus.
//!
//! A [`BusClient`] keeps (re)connecting to the bus through a [`BusTransport`]
//! until told to stop. Every new session is subscribed to the client's topics before
//! anything is read from it.
//!
//! Inbound messages are handed to a [`MessageHandler`], each on its own task.
//! At most `pool_size` handlers run at the same time. When they are all busy,
//! nothing more is read from the session until one of them finishes.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{config::BusConfig, error::Error};

/// The MQTT transport.
pub mod mqtt;

/// A message as received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The topic the message was published on.
    pub topic: String,

    /// The raw payload.
    pub payload: Bytes,
}

impl BusMessage {
    /// Create a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// The payload as text, ignoring any bad utf8 bytes.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Where a [`BusClient`] is in its connect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, possibly waiting before the next attempt.
    Disconnected,

    /// A connection attempt is ongoing.
    Connecting,

    /// Connected and subscribed.
    Connected,
}

/// Puts messages on the bus for a live session.
pub trait Publisher: Send + Sync + Debug {
    /// Publish without waiting for the bus.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), Error>;
}

/// One connected session with the bus.
#[async_trait]
pub trait BusSession: Send {
    /// Subscribe to these topic filters.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), Error>;

    /// Wait for the next inbound message.
    /// `Ok(None)` means the session ended normally.
    async fn next_message(&mut self) -> Result<Option<BusMessage>, Error>;

    /// A handle for publishing on this session.
    fn publisher(&self) -> Arc<dyn Publisher>;

    /// End the session.
    async fn disconnect(&mut self);
}

/// Able to open sessions with a bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn BusSession>, Error>;
}

/// Handles inbound messages of a [`BusClient`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a single message.
    async fn handle(&self, message: BusMessage);
}

struct Shared {
    topics: Vec<String>,
    transport: Arc<dyn BusTransport>,
    handler: Arc<dyn MessageHandler>,
    pool: Arc<Semaphore>,
    retry_interval: Duration,
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    handlers: TaskTracker,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);

        if previous != state {
            debug!(?previous, ?state, "Connection state");
        }
    }

    async fn run(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            let session = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                session = self.transport.connect() => session,
            };

            match session {
                Ok(mut session) => {
                    self.serve(session.as_mut()).await;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(%e, retry_in = ?self.retry_interval, "Can't connect to bus");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {},
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Connect loop done");
    }

    async fn serve(&self, session: &mut dyn BusSession) {
        if self.topics.is_empty() {
            info!("Connected, publishing only");
        } else if let Err(e) = session.subscribe(&self.topics).await {
            warn!(%e, "Could not subscribe");
            self.set_state(ConnectionState::Disconnected);
            session.disconnect().await;
            return;
        } else {
            info!(topics = ?self.topics, "Connected and subscribed");
        }

        *self.publisher.write() = Some(session.publisher());
        self.set_state(ConnectionState::Connected);

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Stopping, leaving session");
                    break;
                }
                message = session.next_message() => message,
            };

            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("Bus session ended");
                    break;
                }
                Err(e) => {
                    warn!(%e, "Bus session lost");
                    break;
                }
            };

            trace!(topic = %message.topic, "Inbound message");

            // Nothing more is read from the session until a handler slot is free.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.pool.clone().acquire_owned() => permit,
            };

            let Ok(permit) = permit else {
                error!("Handler pool closed");
                break;
            };

            let handler = self.handler.clone();
            let span = info_span!("message", topic = %message.topic);

            self.handlers.spawn(
                async move {
                    handler.handle(message).await;
                    drop(permit);
                }
                .instrument(span),
            );
        }

        *self.publisher.write() = None;
        self.set_state(ConnectionState::Disconnected);
        session.disconnect().await;
    }
}

struct Unsubscribed;

#[async_trait]
impl MessageHandler for Unsubscribed {
    async fn handle(&self, message: BusMessage) {
        warn!(topic = %message.topic, "Message without a subscription");
    }
}

/// A client which stays connected to the bus until stopped.
pub struct BusClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("topics", &self.shared.topics)
            .field("state", &self.state())
            .finish()
    }
}

impl BusClient {
    /// Create a client subscribing to `topics`, which must not be empty.
    /// Nothing happens until [`BusClient::start`] is called.
    pub fn new(
        config: &BusConfig,
        transport: Arc<dyn BusTransport>,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, Error> {
        if topics.is_empty() {
            return Err(Error::BadConfig(
                "Subscription topics list can't be empty".into(),
            ));
        }

        Self::build(config, transport, topics, handler)
    }

    /// Create a client which publishes but never subscribes to anything.
    pub fn publish_only(
        config: &BusConfig,
        transport: Arc<dyn BusTransport>,
    ) -> Result<Self, Error> {
        Self::build(config, transport, vec![], Arc::new(Unsubscribed))
    }

    fn build(
        config: &BusConfig,
        transport: Arc<dyn BusTransport>,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, Error> {
        if config.pool_size == 0 {
            return Err(Error::BadConfig(
                "The bus pool size must allow at least one message handler".into(),
            ));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            shared: Arc::new(Shared {
                topics,
                transport,
                handler,
                pool: Arc::new(Semaphore::new(config.pool_size)),
                retry_interval: config.retry_interval(),
                publisher: RwLock::new(None),
                state,
                shutdown: CancellationToken::new(),
                handlers: TaskTracker::new(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Start connecting in the background.
    pub fn start(&self) {
        let mut task = self.task.lock();

        if task.is_some() {
            warn!(topics = ?self.shared.topics, "Bus client already started");
            return;
        }

        let span = info_span!("bus", topics = ?self.shared.topics);
        *task = Some(tokio::spawn(self.shared.clone().run().instrument(span)));
    }

    /// Publish a message.
    /// If not connected the message is dropped.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let publisher = self.shared.publisher.read().clone();

        match publisher {
            Some(publisher) => {
                if let Err(e) = publisher.publish(topic, payload.into()) {
                    warn!(%e, %topic, "Could not publish");
                }
            }
            None => trace!(%topic, "Not connected, dropping message"),
        }
    }

    /// Ask the client to stop. Leaves the current session, if any.
    /// Handlers already running are left to finish.
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
    }

    /// Wait until the connect loop and all message handlers have finished.
    pub async fn join(&self) {
        let task = self.task.lock().take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(?e, "Bus connect loop failed");
            }
        }

        self.shared.handlers.close();
        self.shared.handlers.wait().await;
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Wait until the connection state is `wanted`.
    pub async fn wait_for_state(&self, wanted: ConnectionState) {
        let mut state = self.shared.state.subscribe();

        // The sender lives as long as `self`, so this can't fail.
        let _ = state.wait_for(|state| *state == wanted).await;
    }

    /// The topics this client subscribes to.
    pub fn topics(&self) -> &[String] {
        &self.shared.topics
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mock::MockBus;

    #[derive(Default)]
    struct Counting {
        active: AtomicUsize,
        max_active: AtomicUsize,
        done: AtomicUsize,
        hold: Duration,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _message: BusMessage) {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            tokio::time::sleep(self.hold).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let waiting = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {what}"));
    }

    fn config(pool_size: usize) -> BusConfig {
        BusConfig {
            retry_interval_ms: 10,
            pool_size,
            ..Default::default()
        }
    }

    #[test]
    fn empty_topic_list_is_bad_config() {
        let bus = MockBus::new();

        let err = BusClient::new(&config(10), bus.transport(), vec![], Arc::new(Counting::default()))
            .unwrap_err();

        assert!(err.try_into_bad_config().is_ok());
    }

    #[test]
    fn non_empty_topic_list_is_fine() {
        let bus = MockBus::new();

        let client = BusClient::new(
            &config(10),
            bus.transport(),
            vec!["a/b".into()],
            Arc::new(Counting::default()),
        )
        .unwrap();

        assert_eq!(client.topics(), ["a/b".to_owned()]);
    }

    #[tokio::test]
    async fn publish_only_client_never_subscribes() {
        let bus = MockBus::new();
        let client = BusClient::publish_only(&config(10), bus.transport()).unwrap();
        assert!(client.topics().is_empty());

        client.start();
        client.wait_for_state(ConnectionState::Connected).await;
        assert_eq!(bus.sessions(), 1);

        client.publish("out/x", "only this");
        bus.wait_for_published(1).await;

        assert_eq!(bus.subscriptions_made(), 0);
        assert_eq!(bus.published(), vec![BusMessage::new("out/x", "only this")]);

        client.stop();
        client.join().await;

        assert_eq!(bus.sessions(), 0);
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_dropped() {
        let bus = MockBus::new();
        let client = BusClient::new(
            &config(10),
            bus.transport(),
            vec!["a/b".into()],
            Arc::new(Counting::default()),
        )
        .unwrap();

        client.publish("a/b", "hello");

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn reconnects_after_refusals() {
        let bus = MockBus::new();
        bus.refuse_connections(3);

        let handler = Arc::new(Counting::default());
        let client = BusClient::new(
            &config(10),
            bus.transport(),
            vec!["in/#".into()],
            handler.clone(),
        )
        .unwrap();

        client.start();
        client.wait_for_state(ConnectionState::Connected).await;

        assert_eq!(bus.connection_attempts(), 4);

        client.publish("out/x", "after refusals");
        bus.inject("in/x", "hello");

        bus.wait_for_published(1).await;
        assert_eq!(
            bus.published(),
            vec![BusMessage::new("out/x", "after refusals")]
        );

        eventually("handler", || handler.done.load(Ordering::SeqCst) == 1).await;

        client.stop();
        client.join().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn resubscribes_after_session_loss() {
        let bus = MockBus::new();
        let handler = Arc::new(Counting::default());
        let client = BusClient::new(
            &config(10),
            bus.transport(),
            vec!["in/#".into()],
            handler.clone(),
        )
        .unwrap();

        client.start();
        client.wait_for_state(ConnectionState::Connected).await;

        bus.drop_sessions();
        eventually("second subscription", || bus.subscriptions_made() == 2).await;
        client.wait_for_state(ConnectionState::Connected).await;

        bus.inject("in/x", "hello again");
        eventually("handler", || handler.done.load(Ordering::SeqCst) == 1).await;

        client.stop();
        client.join().await;
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_handlers() {
        const POOL: usize = 3;
        const MESSAGES: usize = 12;

        let bus = MockBus::new();
        let handler = Arc::new(Counting {
            hold: Duration::from_millis(50),
            ..Default::default()
        });
        let client = BusClient::new(
            &config(POOL),
            bus.transport(),
            vec!["in/#".into()],
            handler.clone(),
        )
        .unwrap();

        client.start();
        client.wait_for_state(ConnectionState::Connected).await;

        for i in 0..MESSAGES {
            bus.inject("in/x", format!("message {i}"));
        }

        // While the first handlers hold their slots, the rest must wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.active.load(Ordering::SeqCst), POOL);
        assert_eq!(handler.done.load(Ordering::SeqCst), 0);

        eventually("all handlers", || handler.done.load(Ordering::SeqCst) == MESSAGES).await;

        assert_eq!(handler.max_active.load(Ordering::SeqCst), POOL);

        client.stop();
        client.join().await;
    }
}
