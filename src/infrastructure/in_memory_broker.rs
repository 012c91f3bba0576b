// Copyright 2025 Cowboy AI, LLC.

//! In-memory broker for tests and local development
//!
//! Implements the transport traits with direct-exchange routing, durable
//! queues that buffer messages until a consumer attaches, and fault injection
//! hooks to exercise the reconnect and channel recovery paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal, Delivery, DeliveryAcker,
    DeliveryStream, OutgoingMessage, PublishOutcome, TransportError,
};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, TransportError>>;

struct ConsumerHandle {
    connection_open: Arc<AtomicBool>,
    sender: DeliverySender,
}

impl ConsumerHandle {
    fn is_live(&self) -> bool {
        self.connection_open.load(Ordering::SeqCst) && !self.sender.is_closed()
    }
}

#[derive(Default)]
struct QueueState {
    exchange: String,
    bindings: HashSet<String>,
    backlog: VecDeque<(String, Bytes)>,
    consumer: Option<ConsumerHandle>,
}

struct ConnectionHandle {
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    connections: Vec<ConnectionHandle>,
    connect_attempts: u32,
    fail_next_connects: u32,
    unreachable: bool,
    fail_next_publishes: u32,
    published: u64,
    returned: u64,
    acked: u64,
    unacked: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory message broker
///
/// Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("published", &state.published)
            .finish()
    }
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens connections to this broker
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Refuse every connect attempt while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.lock().unreachable = unreachable;
    }

    /// Refuse the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().fail_next_connects = count;
    }

    /// Fail the next `count` publishes with an I/O error
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.lock().fail_next_publishes = count;
    }

    /// Close every open connection and signal a shutdown on each
    ///
    /// Consumers on those connections receive an error item.
    pub fn shutdown_connections(&self) {
        self.disrupt_connections(ConnectionSignal::Shutdown);
    }

    /// Close every open connection and send `signal` on each
    ///
    /// Consumers on those connections receive an error item.
    pub fn disrupt_connections(&self, signal: ConnectionSignal) {
        let (connections, orphaned) = {
            let mut state = self.shared.lock();
            let connections = std::mem::take(&mut state.connections);
            for connection in &connections {
                connection.open.store(false, Ordering::SeqCst);
            }
            let orphaned: Vec<ConsumerHandle> = state
                .queues
                .values_mut()
                .filter_map(|q| match &q.consumer {
                    Some(consumer) if !consumer.is_live() => q.consumer.take(),
                    _ => None,
                })
                .collect();
            (connections, orphaned)
        };

        for consumer in orphaned {
            let _ = consumer.sender.send(Err(TransportError::ConnectionClosed));
        }
        for connection in connections {
            let _ = connection.signals.send(signal);
        }
    }

    /// Send a signal to every open connection without closing it
    pub fn raise_signal(&self, signal: ConnectionSignal) {
        let state = self.shared.lock();
        for connection in &state.connections {
            let _ = connection.signals.send(signal);
        }
    }

    /// Break the consumer channel of a queue
    ///
    /// The consumer receives an error item and its stream ends.
    pub fn fail_consumer(&self, queue: &str) -> bool {
        let consumer = self
            .shared
            .lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.consumer.take());
        match consumer {
            Some(consumer) => consumer
                .sender
                .send(Err(TransportError::ChannelClosed))
                .is_ok(),
            None => false,
        }
    }

    /// Connect attempts made against this broker
    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    /// Messages accepted by the broker
    pub fn published_count(&self) -> u64 {
        self.shared.lock().published
    }

    /// Mandatory messages that matched no binding
    pub fn returned_count(&self) -> u64 {
        self.shared.lock().returned
    }

    /// Deliveries acknowledged by consumers
    pub fn acked_count(&self) -> u64 {
        self.shared.lock().acked
    }

    /// Deliveries handed to consumers but not yet acknowledged
    pub fn unacked_count(&self) -> u64 {
        self.shared.lock().unacked
    }

    /// Messages waiting in a queue for a consumer
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    /// Routing keys bound to a queue, sorted
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let state = self.shared.lock();
        let mut keys: Vec<String> = state
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Check whether a queue currently has a consumer attached
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.shared
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.as_ref().is_some_and(ConsumerHandle::is_live))
    }
}

/// Connector for an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;

        if state.unreachable {
            return Err(TransportError::Unreachable(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::Unreachable(
                "in-memory broker refused the connection".to_string(),
            ));
        }

        let (signals, _) = broadcast::channel(16);
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(ConnectionHandle {
            open: Arc::clone(&open),
            signals: signals.clone(),
        });
        let connection = Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            open,
            signals,
        });
        debug!(attempt = state.connect_attempts, "In-memory connection opened");
        Ok(connection)
    }
}

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    open: Arc<AtomicBool>,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(Box::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            connection_open: Arc::clone(&self.open),
            closed: AtomicBool::new(false),
        }))
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.shared.lock();
        state
            .connections
            .retain(|c| !Arc::ptr_eq(&c.open, &self.open));
        Ok(())
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    connection_open: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_usable(&self) -> Result<(), TransportError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn queue_on<'a>(
        state: &'a mut BrokerState,
        queue: &str,
        exchange: &str,
    ) -> Result<&'a mut QueueState, TransportError> {
        match state.queues.get_mut(queue) {
            Some(q) if q.exchange == exchange => Ok(q),
            Some(q) => Err(TransportError::Protocol(format!(
                "queue '{queue}' is declared on exchange '{}'",
                q.exchange
            ))),
            None => Err(TransportError::Protocol(format!(
                "queue '{queue}' is not declared"
            ))),
        }
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        state.acked += 1;
        state.unacked = state.unacked.saturating_sub(1);
        Ok(())
    }
}

fn deliver(
    shared: &Arc<Shared>,
    state: &mut BrokerState,
    queue: &str,
    routing_key: String,
    body: Bytes,
) {
    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };

    if let Some(consumer) = q.consumer.as_ref().filter(|c| c.is_live()) {
        let delivery = Delivery::new(
            routing_key.clone(),
            body.clone(),
            Box::new(InMemoryAcker {
                shared: Arc::clone(shared),
            }),
        );
        if consumer.sender.send(Ok(delivery)).is_ok() {
            state.unacked += 1;
            return;
        }
    }
    q.backlog.push_back((routing_key, body));
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.ensure_usable()?;
        self.shared.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, exchange: &str, queue: &str) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let mut state = self.shared.lock();
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Protocol(format!(
                "exchange '{exchange}' is not declared"
            )));
        }
        let entry = state.queues.entry(queue.to_string()).or_default();
        if entry.exchange.is_empty() {
            entry.exchange = exchange.to_string();
        }
        if entry.exchange != exchange {
            return Err(TransportError::Protocol(format!(
                "queue '{queue}' is declared on exchange '{}'",
                entry.exchange
            )));
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let mut state = self.shared.lock();
        Self::queue_on(&mut state, queue, exchange)?
            .bindings
            .insert(routing_key.to_string());
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let mut state = self.shared.lock();
        Self::queue_on(&mut state, queue, exchange)?
            .bindings
            .remove(routing_key);
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<PublishOutcome, TransportError> {
        self.ensure_usable()?;
        let mut state = self.shared.lock();

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(TransportError::Io("in-memory publish failed".to_string()));
        }
        if !state.exchanges.contains(&message.exchange) {
            return Err(TransportError::Protocol(format!(
                "exchange '{}' is not declared",
                message.exchange
            )));
        }

        state.published += 1;
        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| {
                q.exchange == message.exchange && q.bindings.contains(&message.routing_key)
            })
            .map(|(name, _)| name.clone())
            .collect();

        if targets.is_empty() {
            if message.mandatory {
                state.returned += 1;
                return Ok(PublishOutcome::Returned);
            }
            return Ok(PublishOutcome::Routed);
        }

        for queue in targets {
            deliver(
                &self.shared,
                &mut state,
                &queue,
                message.routing_key.clone(),
                message.body.clone(),
            );
        }
        Ok(PublishOutcome::Routed)
    }

    async fn consume(&self, exchange: &str, queue: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_usable()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.lock();
        let q = Self::queue_on(&mut state, queue, exchange)?;
        q.consumer = Some(ConsumerHandle {
            connection_open: Arc::clone(&self.connection_open),
            sender,
        });

        let backlog: Vec<(String, Bytes)> = q.backlog.drain(..).collect();
        for (routing_key, body) in backlog {
            deliver(&self.shared, &mut state, queue, routing_key, body);
        }

        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    fn message(routing_key: &str, body: &'static str) -> OutgoingMessage {
        OutgoingMessage {
            exchange: "bus".to_string(),
            routing_key: routing_key.to_string(),
            body: Bytes::from_static(body.as_bytes()),
            persistent: true,
            mandatory: true,
        }
    }

    async fn channel(broker: &InMemoryBroker) -> Box<dyn BrokerChannel> {
        let connection = broker.connector().connect().await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_binding() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("bus").await.unwrap();
        channel.declare_queue("bus", "orders").await.unwrap();
        channel.bind_queue("orders", "bus", "OrderPlaced").await.unwrap();

        let outcome = channel.publish(message("OrderPlaced", "{}")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Routed);
        let outcome = channel.publish(message("OrderShipped", "{}")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Returned);

        assert_eq!(broker.backlog_len("orders"), 1);
        assert_eq!(broker.returned_count(), 1);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_backlog_is_delivered_in_order_and_acked() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("bus").await.unwrap();
        channel.declare_queue("bus", "orders").await.unwrap();
        channel.bind_queue("orders", "bus", "OrderPlaced").await.unwrap();
        channel.publish(message("OrderPlaced", "1")).await.unwrap();
        channel.publish(message("OrderPlaced", "2")).await.unwrap();

        let mut stream = channel.consume("bus", "orders").await.unwrap();
        for expected in ["1", "2"] {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.body, Bytes::from_static(expected.as_bytes()));
            delivery.ack().await.unwrap();
        }
        assert_eq!(broker.acked_count(), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_fault_injection() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let connector = broker.connector();
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_signals_and_closes() {
        let broker = InMemoryBroker::new();
        let connection = broker.connector().connect().await.unwrap();
        let mut signals = connection.signals();

        broker.shutdown_connections();
        assert!(!connection.is_open());
        assert_eq!(signals.recv().await.unwrap(), ConnectionSignal::Shutdown);
        assert!(matches!(
            connection.create_channel().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_operations() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        assert_ok!(channel.close().await);
        assert_eq!(
            channel.declare_exchange("bus").await,
            Err(TransportError::ChannelClosed)
        );
        assert_err!(channel.publish(message("OrderPlaced", "{}")).await);
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_consumer_yields_error() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("bus").await.unwrap();
        channel.declare_queue("bus", "orders").await.unwrap();
        let mut stream = channel.consume("bus", "orders").await.unwrap();

        assert!(broker.fail_consumer("orders"));
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::ChannelClosed))
        ));
        assert!(stream.next().await.is_none());
        assert!(!broker.has_consumer("orders"));
    }
}
