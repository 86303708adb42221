//! In-memory stand-ins for the bus and for serial devices.
//!
//! These allow running the gateway, connectors included, without a broker
//! or any hardware attached.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, trace};

use crate::{
    bus::{BusMessage, BusSession, BusTransport, Publisher},
    error::Error,
    protocol::{self, DONE_MARKER, START_MARKER},
    serial::{error::SerialPortError, DevicePort, SerialBackend, UsbCandidate},
    topics,
};

struct Session {
    id: u64,
    subscriptions: Vec<String>,
    inbox: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct BusState {
    refusals_left: usize,
    connection_attempts: usize,
    subscriptions_made: usize,
    next_session: u64,
    sessions: Vec<Session>,
    published: Vec<BusMessage>,
}

struct BusInner {
    state: Mutex<BusState>,
    published_count: watch::Sender<usize>,
}

impl BusInner {
    fn deliver(&self, state: &BusState, message: &BusMessage) {
        for session in &state.sessions {
            if session
                .subscriptions
                .iter()
                .any(|filter| topics::matches(filter, &message.topic))
            {
                trace!(session = session.id, topic = %message.topic, "Delivering");
                let _ = session.inbox.send(message.clone());
            }
        }
    }
}

/// An in-memory bus.
///
/// Messages published by any session are delivered to every session
/// with a matching subscription, as well as recorded.
#[derive(Clone)]
pub struct MockBus(Arc<BusInner>);

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// A bus accepting all connections.
    pub fn new() -> Self {
        let (published_count, _) = watch::channel(0);

        Self(Arc::new(BusInner {
            state: Mutex::new(BusState::default()),
            published_count,
        }))
    }

    /// A transport connecting to this bus.
    pub fn transport(&self) -> Arc<dyn BusTransport> {
        Arc::new(self.clone())
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.0.state.lock().refusals_left = n;
    }

    /// How many times anyone tried to connect, refused attempts included.
    pub fn connection_attempts(&self) -> usize {
        self.0.state.lock().connection_attempts
    }

    /// How many times any session subscribed.
    pub fn subscriptions_made(&self) -> usize {
        self.0.state.lock().subscriptions_made
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> usize {
        self.0.state.lock().sessions.len()
    }

    /// Publish from outside any session.
    /// Not recorded in [`MockBus::published`].
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let message = BusMessage::new(topic, payload);
        let state = self.0.state.lock();

        self.0.deliver(&state, &message);
    }

    /// All messages published by sessions so far, oldest first.
    pub fn published(&self) -> Vec<BusMessage> {
        self.0.state.lock().published.clone()
    }

    /// Wait until sessions have published at least `n` messages.
    pub async fn wait_for_published(&self, n: usize) {
        let mut count = self.0.published_count.subscribe();

        // The sender lives as long as `self`.
        let _ = count.wait_for(|count| *count >= n).await;
    }

    /// End every live session, as if the broker went away.
    pub fn drop_sessions(&self) {
        debug!("Dropping all sessions");
        self.0.state.lock().sessions.clear();
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn connect(&self) -> Result<Box<dyn BusSession>, Error> {
        let mut state = self.0.state.lock();
        state.connection_attempts += 1;

        if state.refusals_left > 0 {
            state.refusals_left -= 1;
            return Err(Error::Bus("Connection refused".into()));
        }

        let id = state.next_session;
        state.next_session += 1;

        let (inbox, messages) = mpsc::unbounded_channel();
        state.sessions.push(Session {
            id,
            subscriptions: vec![],
            inbox,
        });

        Ok(Box::new(MockSession {
            id,
            bus: self.clone(),
            messages,
        }))
    }
}

struct MockSession {
    id: u64,
    bus: MockBus,
    messages: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl BusSession for MockSession {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), Error> {
        let mut state = self.bus.0.state.lock();
        state.subscriptions_made += 1;

        let session = state
            .sessions
            .iter_mut()
            .find(|session| session.id == self.id)
            .ok_or_else(|| Error::Bus("Session is gone".into()))?;

        session.subscriptions.extend(topics.iter().cloned());

        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<BusMessage>, Error> {
        Ok(self.messages.recv().await)
    }

    fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MockPublisher {
            id: self.id,
            bus: self.bus.clone(),
        })
    }

    async fn disconnect(&mut self) {
        self.bus
            .0
            .state
            .lock()
            .sessions
            .retain(|session| session.id != self.id);
    }
}

struct MockPublisher {
    id: u64,
    bus: MockBus,
}

impl std::fmt::Debug for MockPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockPublisher({})", self.id)
    }
}

impl Publisher for MockPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), Error> {
        let message = BusMessage::new(topic, payload);
        let mut state = self.bus.0.state.lock();

        if !state.sessions.iter().any(|session| session.id == self.id) {
            return Err(Error::Bus("Session is gone".into()));
        }

        self.bus.0.deliver(&state, &message);
        state.published.push(message);

        let count = state.published.len();
        self.bus.0.published_count.send_replace(count);

        Ok(())
    }
}

#[derive(Debug)]
struct DeviceState {
    sensors: Vec<String>,
    speaks_protocol: bool,
    to_gateway: VecDeque<String>,
    unterminated: String,
    from_gateway: Vec<String>,
    open: bool,
    failing: bool,
}

/// A simulated sensor device.
///
/// It answers the enumerate request with its sensors,
/// and records every line the gateway writes to it.
#[derive(Debug, Clone)]
pub struct MockDevice(Arc<Mutex<DeviceState>>);

impl MockDevice {
    /// A device declaring these sensors when asked.
    pub fn new<S: AsRef<str>>(sensors: &[S]) -> Self {
        Self(Arc::new(Mutex::new(DeviceState {
            sensors: sensors.iter().map(|s| s.as_ref().to_owned()).collect(),
            speaks_protocol: true,
            to_gateway: VecDeque::new(),
            unterminated: String::new(),
            from_gateway: vec![],
            open: false,
            failing: false,
        })))
    }

    /// A device which never answers the enumerate request.
    pub fn silent() -> Self {
        let device = Self::new::<&str>(&[]);
        device.0.lock().speaks_protocol = false;
        device
    }

    /// Have the device emit a line.
    pub fn send_line(&self, line: &str) {
        self.0.lock().to_gateway.push_back(line.to_owned());
    }

    /// Have the device emit the start of a line, without ever ending it.
    pub fn send_fragment(&self, fragment: &str) {
        self.0.lock().unterminated.push_str(fragment);
    }

    /// Have the device report a value for one of its sensors.
    pub fn send_data(&self, sensor: &str, value: &str) {
        self.send_line(&format!(
            "DATA{sep}{sensor}{sep}{value}",
            sep = protocol::SEPARATOR
        ));
    }

    /// Every line the gateway has written, oldest first.
    pub fn written(&self) -> Vec<String> {
        self.0.lock().from_gateway.clone()
    }

    /// Whether the gateway holds the device open.
    pub fn is_open(&self) -> bool {
        self.0.lock().open
    }

    /// Make all reads and writes fail, or stop doing so.
    pub fn set_failing(&self, failing: bool) {
        self.0.lock().failing = failing;
    }

    fn broken_pipe() -> SerialPortError {
        SerialPortError::IO(io::Error::new(io::ErrorKind::BrokenPipe, "mock failure"))
    }
}

/// An open link to a [`MockDevice`].
#[derive(Debug)]
struct MockPort {
    path: String,
    device: MockDevice,
}

/// Poll period when waiting for a device line.
const MOCK_READ_POLL: Duration = Duration::from_millis(2);

#[async_trait]
impl DevicePort for MockPort {
    fn path(&self) -> &str {
        &self.path
    }

    async fn write_line(&mut self, line: String) -> Result<(), SerialPortError> {
        let mut state = self.device.0.lock();

        if state.failing {
            return Err(MockDevice::broken_pipe());
        }

        if state.speaks_protocol && line == protocol::enumerate_request() {
            let answer = std::iter::once(START_MARKER.to_owned())
                .chain(
                    state
                        .sensors
                        .iter()
                        .map(|sensor| format!("SENSOR{}{sensor}", protocol::SEPARATOR)),
                )
                .chain(std::iter::once(DONE_MARKER.to_owned()))
                .collect::<Vec<_>>();

            state.to_gateway.extend(answer);
        }

        state.from_gateway.push(line);

        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<Option<String>, SerialPortError> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = self.device.0.lock();

                if state.failing {
                    return Err(MockDevice::broken_pipe());
                }

                if let Some(line) = state.to_gateway.pop_front() {
                    return Ok(Some(line));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(MOCK_READ_POLL.min(deadline - now)).await;
        }
    }

    fn has_pending_input(&mut self) -> Result<bool, SerialPortError> {
        let state = self.device.0.lock();

        if state.failing {
            return Err(MockDevice::broken_pipe());
        }

        Ok(!state.to_gateway.is_empty() || !state.unterminated.is_empty())
    }

    async fn close(&mut self) {
        self.device.0.lock().open = false;
    }
}

#[derive(Default)]
struct BackendState {
    attached: BTreeMap<String, (UsbCandidate, MockDevice)>,
    opened: usize,
}

/// Simulated USB attachment of [`MockDevice`]s.
#[derive(Clone, Default)]
pub struct MockBackend(Arc<Mutex<BackendState>>);

impl MockBackend {
    /// Nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend to hand to a connector.
    pub fn backend(&self) -> Arc<dyn SerialBackend> {
        Arc::new(self.clone())
    }

    /// Attach a device described by `candidate`.
    pub fn plug(&self, candidate: UsbCandidate, device: MockDevice) {
        debug!(path = %candidate.path, "Plugging mock device");
        self.0
            .lock()
            .attached
            .insert(candidate.path.clone(), (candidate, device));
    }

    /// Attach a device which looks like an Arduino board.
    pub fn plug_arduino(&self, path: &str, device: MockDevice) {
        self.plug(
            UsbCandidate::new(path)
                .with_manufacturer("Arduino (www.arduino.cc)")
                .with_product("Arduino Uno"),
            device,
        );
    }

    /// Detach the device at `path`.
    pub fn unplug(&self, path: &str) {
        debug!(%path, "Unplugging mock device");
        self.0.lock().attached.remove(path);
    }

    /// How many times any device was opened.
    pub fn opened(&self) -> usize {
        self.0.lock().opened
    }
}

#[async_trait]
impl SerialBackend for MockBackend {
    fn available(&self) -> Result<Vec<UsbCandidate>, SerialPortError> {
        Ok(self
            .0
            .lock()
            .attached
            .values()
            .map(|(candidate, _)| candidate.clone())
            .collect())
    }

    async fn open(&self, path: &str) -> Result<Box<dyn DevicePort>, SerialPortError> {
        let mut state = self.0.lock();

        let Some((_, device)) = state.attached.get(path) else {
            return Err(SerialPortError::Open {
                path: path.to_owned(),
                problem: "No such device".into(),
            });
        };

        let device = device.clone();
        device.0.lock().open = true;
        state.opened += 1;

        Ok(Box::new(MockPort {
            path: path.to_owned(),
            device,
        }))
    }
}
