//! The subscription facade.

use relay_protocol::{
    ControlFunction, Envelope, EnvelopeCodec, ProtocolError, Topic, LOOPBACK_CHANNEL,
};
use relay_transport::{Connection, ConnectionState, Connector, RetryPolicy, WebSocketConnector};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A subscriber callback. Receives the message payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The channel/event pair is not a valid topic.
    #[error(transparent)]
    InvalidTopic(#[from] ProtocolError),

    /// The message needs the network but the connection is not open.
    #[error("Not connected to the relay")]
    NotConnected,
}

/// Client options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Spacing of reconnect attempts.
    pub retry: RetryPolicy,
    /// Re-send `register` for every known topic after each (re)connect.
    ///
    /// When `false` only topics subscribed while disconnected are sent,
    /// which assumes the relay kept the earlier subscriptions.
    pub resubscribe_on_reconnect: bool,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::constant(Duration::from_millis(1_000)),
            resubscribe_on_reconnect: true,
            max_message_size: EnvelopeCodec::default().max_frame_size(),
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    callbacks: HashMap<Topic, Vec<Callback>>,
    /// Network topics in first-subscribe order.
    known: Vec<Topic>,
    /// Topics whose `register` has not reached an open connection yet.
    pending: VecDeque<Topic>,
    /// Queue into the live connection, present only while open.
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
}

impl Subscriptions {
    /// Hand a control message to the live connection, or remember the
    /// topic for the next open.
    fn request(&mut self, envelope: Envelope, topic: Topic) {
        if let Some(tx) = &self.outbound {
            if tx.send(envelope).is_ok() {
                return;
            }
        }
        self.pending.push_back(topic);
    }
}

struct Shared {
    subscriptions: Mutex<Subscriptions>,
    state: watch::Sender<ConnectionState>,
    options: ClientOptions,
    codec: EnvelopeCodec,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Invoke the topic's callbacks in registration order, with no lock held.
    fn dispatch(&self, envelope: &Envelope) {
        let callbacks = self
            .lock()
            .callbacks
            .get(&envelope.topic)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            trace!(topic = %envelope.topic, "No local callbacks");
            return;
        }
        for callback in &callbacks {
            callback(&envelope.payload);
        }
    }

    /// Install the outbound queue for a fresh connection and queue the
    /// registrations it must replay.
    fn open(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.lock();

        let replay: Vec<Topic> = if self.options.resubscribe_on_reconnect {
            subs.known.clone()
        } else {
            subs.pending.iter().cloned().collect()
        };
        subs.pending.clear();

        debug!(topics = replay.len(), "Replaying registrations");
        for topic in &replay {
            // The receiver is held right here, so this cannot fail.
            let _ = tx.send(Envelope::register(topic));
        }
        subs.outbound = Some(tx);
        drop(subs);

        self.set_state(ConnectionState::Open);
        rx
    }

    fn close(&self) {
        self.lock().outbound = None;
        self.set_state(ConnectionState::Closed);
    }

    async fn pump(
        &self,
        mut conn: Box<dyn Connection>,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut unsent = None;
        loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Ok(Some(frame)) => match frame.decode(&self.codec) {
                        Ok(envelope) => self.dispatch(&envelope),
                        Err(e) => debug!(error = %e, "Dropping malformed frame"),
                    },
                    Ok(None) => {
                        debug!("Connection closed by relay");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection error");
                        break;
                    }
                },
                Some(envelope) = outbound.recv() => {
                    if let Err(e) = conn.send_envelope(&envelope).await {
                        warn!(error = %e, topic = %envelope.topic, "Send failed");
                        unsent = Some(envelope);
                        break;
                    }
                }
            }
        }

        // Later requests fail to enqueue and land in `pending` directly.
        outbound.close();
        self.requeue(unsent, &mut outbound);

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Close failed");
        }
    }

    /// Put registrations the dropped connection never sent back at the front
    /// of the pending queue, in their original order.
    fn requeue(
        &self,
        failed: Option<Envelope>,
        outbound: &mut mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut unsent: Vec<Envelope> = failed.into_iter().collect();
        while let Ok(envelope) = outbound.try_recv() {
            unsent.push(envelope);
        }

        let mut subs = self.lock();
        let mut requeued = VecDeque::new();
        for envelope in unsent {
            if !matches!(envelope.control_function(), Some(ControlFunction::Register)) {
                continue;
            }
            for topic in envelope.control_topics().into_iter().flatten() {
                let wanted = subs.callbacks.contains_key(&topic);
                if wanted && !requeued.contains(&topic) && !subs.pending.contains(&topic) {
                    requeued.push_back(topic);
                }
            }
        }

        if !requeued.is_empty() {
            debug!(topics = requeued.len(), "Requeued unsent registrations");
            requeued.append(&mut subs.pending);
            subs.pending = requeued;
        }
    }
}

/// Background task: connect, pump until the connection drops, wait, repeat.
async fn run(shared: Arc<Shared>, connector: Arc<dyn Connector>) {
    let mut failures: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);

        match connector.connect().await {
            Ok(conn) => {
                failures = 0;
                info!(endpoint = connector.endpoint(), "Connected to relay");
                let outbound = shared.open();
                shared.pump(conn, outbound).await;
            }
            Err(e) => {
                warn!(endpoint = connector.endpoint(), error = %e, "Relay unavailable");
            }
        }

        shared.close();
        let delay = shared.options.retry.delay(failures);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        tokio::time::sleep(delay).await;
        failures = failures.saturating_add(1);
    }
}

/// Consumer-side handle to the relay.
///
/// Keeps one connection open in the background, reconnecting forever, and
/// dispatches incoming messages to locally registered callbacks.
pub struct RelayClient {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to a relay at a WebSocket URL.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect(url: impl Into<String>, options: ClientOptions) -> Self {
        Self::with_connector(Arc::new(WebSocketConnector::new(url)), options)
    }

    /// Connect through any connector.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>, options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(Subscriptions::default()),
            state,
            codec: EnvelopeCodec::new(options.max_message_size),
            options,
        });

        let task = tokio::spawn(run(Arc::clone(&shared), connector));
        Self { shared, task }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Register a callback for `channel:event`.
    ///
    /// The first callback for a topic sends `register` to the relay (or
    /// queues it until the connection opens). Callbacks for one topic run in
    /// the order they were added. Loopback topics never reach the relay.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTopic`] if `channel:event` is not a valid topic.
    pub fn subscribe<F>(&self, channel: &str, event: &str, callback: F) -> Result<(), ClientError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = Topic::new(channel, event)?;
        let mut subs = self.shared.lock();

        let callbacks = subs.callbacks.entry(topic.clone()).or_default();
        let first = callbacks.is_empty();
        callbacks.push(Arc::new(callback));

        if first && !topic.is_on(LOOPBACK_CHANNEL) {
            debug!(topic = %topic, "Registering topic");
            subs.known.push(topic.clone());
            subs.request(Envelope::register(&topic), topic);
        }
        Ok(())
    }

    /// Drop every callback for `channel:event` and unregister it.
    ///
    /// Returns `false` if nothing was subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTopic`] if `channel:event` is not a valid topic.
    pub fn unsubscribe(&self, channel: &str, event: &str) -> Result<bool, ClientError> {
        let topic = Topic::new(channel, event)?;
        let mut subs = self.shared.lock();

        if subs.callbacks.remove(&topic).is_none() {
            return Ok(false);
        }
        if topic.is_on(LOOPBACK_CHANNEL) {
            return Ok(true);
        }

        subs.known.retain(|t| t != &topic);
        let was_pending = subs.pending.len();
        subs.pending.retain(|t| t != &topic);

        // Only a topic the relay has seen needs an explicit unregister.
        if subs.pending.len() == was_pending {
            if let Some(tx) = &subs.outbound {
                let _ = tx.send(Envelope::unregister(&topic));
            }
        }
        Ok(true)
    }

    /// Publish a message on `channel:event`.
    ///
    /// Loopback messages are dispatched to local callbacks on the calling
    /// thread. Everything else is sent to the relay at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or the connection is not open.
    pub fn send(&self, channel: &str, event: &str, payload: Value) -> Result<(), ClientError> {
        let envelope = Envelope::new(Topic::new(channel, event)?, payload);

        if envelope.is_loopback() {
            self.shared.dispatch(&envelope);
            return Ok(());
        }

        let subs = self.shared.lock();
        let tx = subs.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(envelope).map_err(|_| ClientError::NotConnected)
    }

    /// Topics the client is subscribed to on the relay, in subscribe order.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.shared.lock().known.clone()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transport::memory::{self, MemoryConnection, MemoryListener};
    use relay_transport::RawFrame;
    use serde_json::json;

    fn options() -> ClientOptions {
        ClientOptions {
            retry: RetryPolicy::constant(Duration::from_millis(100)),
            ..ClientOptions::default()
        }
    }

    fn spawn_client(
        options: ClientOptions,
    ) -> (RelayClient, Arc<memory::MemoryConnector>, MemoryListener) {
        let (connector, listener) = memory::channel();
        let connector = Arc::new(connector);
        let client = RelayClient::with_connector(connector.clone(), options);
        (client, connector, listener)
    }

    async fn next_envelope(conn: &mut MemoryConnection) -> Envelope {
        let frame = conn.recv().await.unwrap().expect("connection open");
        frame.decode(&EnvelopeCodec::default()).unwrap()
    }

    async fn wait_for(client: &RelayClient, state: ConnectionState) {
        let mut changes = client.state_changes();
        changes.wait_for(|s| *s == state).await.unwrap();
    }

    fn register(topic: &str) -> Envelope {
        Envelope::register(&Topic::parse(topic).unwrap())
    }

    #[tokio::test]
    async fn test_pending_registrations_flush_in_order() {
        let (client, _connector, mut listener) = spawn_client(options());

        client.subscribe("game", "update_state", |_| {}).unwrap();
        client.subscribe("game", "goal_scored", |_| {}).unwrap();
        client.subscribe("game", "clock", |_| {}).unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:update_state"));
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));
        assert_eq!(next_envelope(&mut server).await, register("game:clock"));

        wait_for(&client, ConnectionState::Open).await;
        client.subscribe("game", "replay_start", |_| {}).unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:replay_start"));
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let (client, _connector, mut listener) = spawn_client(options());
        let (tx, mut rx) = mpsc::unbounded_channel();

        for tag in ["first", "second"] {
            let tx = tx.clone();
            client
                .subscribe("game", "goal_scored", move |payload| {
                    let _ = tx.send((tag, payload.clone()));
                })
                .unwrap();
        }

        let mut server = listener.accept().await.unwrap();
        // One register, no matter how many callbacks.
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));

        let goal = Envelope::new(Topic::parse("game:goal_scored").unwrap(), json!({"scorer": "X"}));
        server.send(RawFrame::encode(&goal).unwrap()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("first", json!({"scorer": "X"})));
        assert_eq!(rx.recv().await.unwrap(), ("second", json!({"scorer": "X"})));
    }

    #[tokio::test]
    async fn test_loopback_never_reaches_network() {
        let (client, _connector, mut listener) = spawn_client(options());
        let (tx, mut rx) = mpsc::unbounded_channel();

        client
            .subscribe(LOOPBACK_CHANNEL, "toggle", move |payload| {
                let _ = tx.send(payload.clone());
            })
            .unwrap();
        client.subscribe("game", "clock", |_| {}).unwrap();

        let mut server = listener.accept().await.unwrap();
        wait_for(&client, ConnectionState::Open).await;

        client.send(LOOPBACK_CHANNEL, "toggle", json!(true)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), json!(true));

        client.send("game", "ping", json!(1)).unwrap();

        // Only the network topic was registered and only the network send arrived.
        assert_eq!(next_envelope(&mut server).await, register("game:clock"));
        let sent = next_envelope(&mut server).await;
        assert_eq!(sent.topic.as_str(), "game:ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_known_topics() {
        let (client, connector, mut listener) = spawn_client(options());

        client.subscribe("game", "update_state", |_| {}).unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:update_state"));
        wait_for(&client, ConnectionState::Open).await;

        client.subscribe("game", "goal_scored", |_| {}).unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));

        drop(server);
        wait_for(&client, ConnectionState::Closed).await;

        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:update_state"));
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_only_pending_when_not_resubscribing() {
        let (client, _connector, mut listener) = spawn_client(ClientOptions {
            resubscribe_on_reconnect: false,
            ..options()
        });

        client.subscribe("game", "update_state", |_| {}).unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:update_state"));
        wait_for(&client, ConnectionState::Open).await;

        drop(server);
        wait_for(&client, ConnectionState::Closed).await;
        client.subscribe("game", "goal_scored", |_| {}).unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_racing_a_dropped_connection_is_replayed() {
        let (client, _connector, mut listener) = spawn_client(ClientOptions {
            resubscribe_on_reconnect: false,
            ..options()
        });

        client.subscribe("game", "update_state", |_| {}).unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:update_state"));
        wait_for(&client, ConnectionState::Open).await;

        // The relay is gone but the background task has not noticed yet.
        drop(server);
        client.subscribe("game", "goal_scored", |_| {}).unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:goal_scored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_while_relay_is_down() {
        let (client, connector, mut listener) = spawn_client(options());
        connector.set_refusing(true);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(connector.attempts() >= 3);
        assert_ne!(client.state(), ConnectionState::Open);

        connector.set_refusing(false);
        assert!(listener.accept().await.is_some());
        wait_for(&client, ConnectionState::Open).await;
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        let (client, _connector, _listener) = spawn_client(options());
        assert!(matches!(
            client.send("game", "clock", json!(1)),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_at_subscribe() {
        let (client, _connector, _listener) = spawn_client(options());
        assert!(matches!(
            client.subscribe("game", "", |_| {}),
            Err(ClientError::InvalidTopic(_))
        ));
        assert!(matches!(
            client.subscribe("ga:me", "clock", |_| {}),
            Err(ClientError::InvalidTopic(_))
        ));
        assert!(client.topics().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_unregister() {
        let (client, _connector, mut listener) = spawn_client(options());
        client.subscribe("game", "clock", |_| {}).unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut server).await, register("game:clock"));
        wait_for(&client, ConnectionState::Open).await;

        assert!(client.unsubscribe("game", "clock").unwrap());
        assert!(!client.unsubscribe("game", "clock").unwrap());
        assert_eq!(
            next_envelope(&mut server).await,
            Envelope::unregister(&Topic::parse("game:clock").unwrap())
        );
        assert!(client.topics().is_empty());
    }
}
