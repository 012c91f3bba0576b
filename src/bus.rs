// Copyright 2025 Cowboy AI, LLC.

//! Durable publish/subscribe event bus
//!
//! [`EventBus`] publishes integration events to a broker exchange, routed by
//! event name, and consumes its own durable queue. Every delivery is decoded
//! and dispatched to each subscribed handler type, resolved from a fresh
//! container scope, in registration order. The delivery is acknowledged once
//! every handler has been attempted, whatever the outcome.
//!
//! Handler failures are logged and the message is still acknowledged. There
//! is no redelivery and no dead-letter exchange, so a failing handler loses
//! that message.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::EventBusConfig;
use crate::errors::{EventBusError, EventBusResult};
use crate::event_handler::IntegrationEventHandler;
use crate::events::{simple_type_name, IntegrationEvent};
use crate::infrastructure::persistent_connection::PersistentConnection;
use crate::infrastructure::transport::{
    BrokerChannel, Delivery, DeliveryStream, OutgoingMessage, PublishOutcome, TransportError,
};
use crate::integration::ServiceContainer;
use crate::subscriptions::{EventNameRemoved, RegistryError, SubscriptionRegistry};

/// Payload substring that makes the consumer raise a handling error
pub const FAULT_INJECTION_MARKER: &str = "throw-fake-exception";

/// Lifecycle of an [`EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Not yet initialized
    Uninitialized,
    /// Declaring topology and starting the consumer
    Initializing,
    /// Publishing and consuming
    Ready,
    /// Replacing a failed consumer channel
    Recreating,
    /// Closed for good
    Closed,
}

/// Errors raised while processing a delivery
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The body is not UTF-8 text
    #[error("Message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The body carries the fault injection marker
    #[error("Fake exception requested by '{event_name}' payload")]
    FaultInjected {
        /// Routing key of the message
        event_name: String,
    },
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReport {
    /// Nothing is subscribed to the event name; the message was dropped
    NoSubscriptions,
    /// Handlers were attempted
    Dispatched {
        /// Handlers called
        invoked: usize,
        /// Called handlers that returned an error
        failed: usize,
        /// Subscriptions skipped because resolution or decoding failed
        skipped: usize,
    },
}

struct Consumer {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct BusInner {
    connection: PersistentConnection,
    container: ServiceContainer,
    registry: SubscriptionRegistry,
    config: EventBusConfig,
    queue_name: RwLock<Option<String>>,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
    topology: tokio::sync::Mutex<()>,
    state: watch::Sender<BusState>,
    closed: AtomicBool,
    removal_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(listener) = self
            .removal_listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        // Dropping the stop sender ends the consumer task.
        self.consumer.get_mut().take();
    }
}

/// Integration event bus over a broker connection
///
/// Clones share the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("exchange", &self.inner.config.exchange_name)
            .field("queue", &self.queue_name())
            .field("state", &self.state())
            .finish()
    }
}

impl EventBus {
    /// Create a bus, declare its topology and start consuming
    ///
    /// Fails with [`EventBusError::InvalidQueueName`] before any I/O when the
    /// queue name is blank.
    pub async fn create(
        connection: PersistentConnection,
        container: ServiceContainer,
        config: EventBusConfig,
    ) -> EventBusResult<Self> {
        if config.queue_name.trim().is_empty() {
            return Err(EventBusError::InvalidQueueName(config.queue_name));
        }

        let (state, _) = watch::channel(BusState::Uninitialized);
        let registry = SubscriptionRegistry::new();
        let removals = registry.watch_removals();
        let queue_name = config.queue_name.clone();

        let inner = Arc::new(BusInner {
            connection,
            container,
            registry,
            config,
            queue_name: RwLock::new(Some(queue_name.clone())),
            consumer: tokio::sync::Mutex::new(None),
            topology: tokio::sync::Mutex::new(()),
            state,
            closed: AtomicBool::new(false),
            removal_listener: Mutex::new(None),
        });

        inner.set_state(BusState::Initializing);
        inner.ensure_consumer(&queue_name).await?;
        inner.spawn_removal_listener(removals);
        inner.set_state(BusState::Ready);

        info!(
            exchange = %inner.config.exchange_name,
            queue = %queue_name,
            "Event bus ready"
        );
        Ok(Self { inner })
    }

    /// Publish an event, routed by its event name
    ///
    /// Transient broker failures are retried with backoff; exhaustion surfaces
    /// as [`EventBusError::BrokerUnreachable`].
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> EventBusResult<()> {
        self.inner.ensure_open()?;
        let event_name = E::event_name();
        let channel = self.inner.connection.create_channel().await?;
        let result = self.inner.publish_on(channel.as_ref(), event, event_name).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close publish channel");
        }
        result
    }

    /// Subscribe handler type `H` to event type `E`
    ///
    /// The handler is resolved from the container for every delivery.
    pub async fn subscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.inner.ensure_open()?;
        let event_name = E::event_name();
        let registry = &self.inner.registry;

        let duplicate = registry
            .handlers_for_event(event_name)
            .iter()
            .any(|s| s.handler_type().type_id() == TypeId::of::<H>());
        if duplicate {
            return Err(RegistryError::DuplicateSubscription {
                event_name: event_name.to_string(),
                handler: simple_type_name::<H>().to_string(),
            }
            .into());
        }

        let _topology = self.inner.topology.lock().await;
        let queue = self.inner.activate_queue();

        if !registry.has_subscriptions_for_event(event_name) {
            self.inner.bind(&queue, event_name).await?;
        }

        registry.add_subscription::<E, H>()?;
        info!(
            event_name,
            handler = simple_type_name::<H>(),
            queue = %queue,
            "Subscribing to event"
        );

        self.inner.ensure_consumer(&queue).await
    }

    /// Remove the subscription of handler type `H` to event type `E`
    ///
    /// Returns false when no such subscription exists. Broker routing is
    /// updated in the background once the last handler of an event is gone.
    pub fn unsubscribe<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let removed = self.inner.registry.remove_subscription::<E, H>();
        if removed {
            info!(
                event_name = E::event_name(),
                handler = simple_type_name::<H>(),
                "Unsubscribed from event"
            );
        }
        removed
    }

    /// Dispatch a message body to every handler subscribed to `event_name`
    pub async fn process_event(&self, event_name: &str, message: &str) -> DispatchReport {
        self.inner.process_event(event_name, message).await
    }

    /// Stop consuming and drop every subscription; idempotent
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(listener) = self
            .inner
            .removal_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }

        let consumer = self.inner.detach_consumer().await;
        self.inner.registry.clear();
        self.inner.set_queue(None);
        self.inner.set_state(BusState::Closed);
        if let Some(task) = consumer {
            join_consumer(task).await;
        }
        info!(exchange = %self.inner.config.exchange_name, "Event bus closed");
    }

    /// Current lifecycle state
    pub fn state(&self) -> BusState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every lifecycle change
    pub fn state_watch(&self) -> watch::Receiver<BusState> {
        self.inner.state.subscribe()
    }

    /// Queue currently consumed, `None` after every subscription was removed
    pub fn queue_name(&self) -> Option<String> {
        self.inner.queue()
    }

    /// Exchange the bus publishes to
    pub fn exchange_name(&self) -> &str {
        &self.inner.config.exchange_name
    }

    /// Subscription registry of this bus
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Broker connection used by this bus
    pub fn connection(&self) -> &PersistentConnection {
        &self.inner.connection
    }
}

impl BusInner {
    fn set_state(&self, state: BusState) {
        self.state.send_replace(state);
    }

    fn ensure_open(&self) -> EventBusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EventBusError::Closed)
        } else {
            Ok(())
        }
    }

    fn queue(&self) -> Option<String> {
        self.queue_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_queue(&self, queue: Option<String>) {
        *self
            .queue_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = queue;
    }

    /// Active queue, restored from configuration after a teardown
    fn activate_queue(&self) -> String {
        let mut queue = self
            .queue_name
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        queue
            .get_or_insert_with(|| self.config.queue_name.clone())
            .clone()
    }

    async fn publish_on<E: IntegrationEvent>(
        &self,
        channel: &dyn BrokerChannel,
        event: &E,
        event_name: &str,
    ) -> EventBusResult<()> {
        let exchange = &self.config.exchange_name;
        channel.declare_exchange(exchange).await?;

        let body = Bytes::from(codec::encode(event)?);
        debug!(
            event_id = %event.id(),
            event_name,
            "Publishing event to broker"
        );

        let outcome = self
            .config
            .retry
            .execute("Publish", move |_| {
                channel.publish(OutgoingMessage {
                    exchange: exchange.clone(),
                    routing_key: event_name.to_string(),
                    body: body.clone(),
                    persistent: true,
                    mandatory: true,
                })
            })
            .await
            .map_err(|failure| {
                if failure.exhausted {
                    error!(
                        event_id = %event.id(),
                        event_name,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Could not publish event"
                    );
                    EventBusError::BrokerUnreachable {
                        attempts: failure.attempts,
                        reason: failure.error.to_string(),
                    }
                } else {
                    EventBusError::Transport(failure.error)
                }
            })?;

        if outcome == PublishOutcome::Returned {
            warn!(
                event_id = %event.id(),
                event_name,
                "Published event was not routed to any queue"
            );
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, event_name: &str) -> EventBusResult<()> {
        let exchange = &self.config.exchange_name;
        let channel = self.connection.create_channel().await?;
        let result: Result<(), TransportError> = async {
            channel.declare_exchange(exchange).await?;
            channel.declare_queue(exchange, queue).await?;
            channel.bind_queue(queue, exchange, event_name).await
        }
        .await;
        let _ = channel.close().await;
        result?;
        debug!(event_name, queue, "Queue bound");
        Ok(())
    }

    async fn unbind(&self, queue: &str, event_name: &str) -> EventBusResult<()> {
        let channel = self.connection.create_channel().await?;
        let result = channel
            .unbind_queue(queue, &self.config.exchange_name, event_name)
            .await;
        let _ = channel.close().await;
        result?;
        debug!(event_name, queue, "Queue unbound");
        Ok(())
    }

    async fn open_consumer(
        &self,
        queue: &str,
    ) -> EventBusResult<(Box<dyn BrokerChannel>, DeliveryStream)> {
        let exchange = &self.config.exchange_name;
        let channel = self.connection.create_channel().await?;
        let stream: Result<DeliveryStream, TransportError> = async {
            channel.declare_exchange(exchange).await?;
            channel.declare_queue(exchange, queue).await?;
            channel.consume(exchange, queue).await
        }
        .await;

        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                let _ = channel.close().await;
                Err(e.into())
            }
        }
    }

    async fn ensure_consumer(self: &Arc<Self>, queue: &str) -> EventBusResult<()> {
        let mut consumer = self.consumer.lock().await;
        if consumer.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return Ok(());
        }

        let (channel, stream) = self.open_consumer(queue).await?;
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(run_consumer(
            Arc::downgrade(self),
            queue.to_string(),
            channel,
            stream,
            stopped,
        ));
        *consumer = Some(Consumer { stop, task });
        debug!(queue, "Consumer started");
        Ok(())
    }

    /// Take the running consumer and tell it to stop
    async fn detach_consumer(&self) -> Option<JoinHandle<()>> {
        let consumer = self.consumer.lock().await.take()?;
        let _ = consumer.stop.send(());
        Some(consumer.task)
    }

    fn spawn_removal_listener(
        self: &Arc<Self>,
        mut removals: broadcast::Receiver<EventNameRemoved>,
    ) {
        let bus = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let removed = match removals.recv().await {
                    Ok(removed) => removed,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed event name removal notifications");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(bus) = bus.upgrade() else { break };
                bus.on_event_name_removed(&removed.event_name).await;
            }
        });
        *self
            .removal_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn on_event_name_removed(&self, event_name: &str) {
        if let Some(task) = self.release_event_name(event_name).await {
            join_consumer(task).await;
        }
    }

    /// Unbind a vanished event name, detaching the consumer when nothing is
    /// subscribed any more
    async fn release_event_name(&self, event_name: &str) -> Option<JoinHandle<()>> {
        let _topology = self.topology.lock().await;
        if self.closed.load(Ordering::SeqCst)
            || self.registry.has_subscriptions_for_event(event_name)
        {
            return None;
        }
        let queue = self.queue()?;

        if let Err(e) = self.unbind(&queue, event_name).await {
            warn!(event_name, queue = %queue, error = %e, "Failed to unbind queue");
        }

        if !self.registry.is_empty() {
            return None;
        }
        let task = self.detach_consumer().await;
        self.set_queue(None);
        info!(queue = %queue, "No subscriptions left, consumer stopped");
        task
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let (event_name, body, acker) = delivery.into_parts();

        if let Err(e) = self.process_delivery(&event_name, &body).await {
            error!(
                event_name = %event_name,
                payload = %String::from_utf8_lossy(&body),
                error = %e,
                "Error processing integration event"
            );
        }

        // Acknowledged even on failure: there is no dead-letter exchange.
        if let Err(e) = acker.ack().await {
            warn!(event_name = %event_name, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn process_delivery(&self, event_name: &str, body: &[u8]) -> Result<(), DispatchError> {
        let message = std::str::from_utf8(body)?;
        if message.contains(FAULT_INJECTION_MARKER) {
            return Err(DispatchError::FaultInjected {
                event_name: event_name.to_string(),
            });
        }
        let report = self.process_event(event_name, message).await;
        debug!(event_name, ?report, "Integration event processed");
        Ok(())
    }

    async fn process_event(&self, event_name: &str, message: &str) -> DispatchReport {
        if !self.registry.has_subscriptions_for_event(event_name) {
            warn!(event_name, "No subscription for integration event");
            return DispatchReport::NoSubscriptions;
        }

        let (mut invoked, mut failed, mut skipped) = (0, 0, 0);
        for subscription in self.registry.handlers_for_event(event_name) {
            let handler_type = subscription.handler_type();
            let scope = self.container.create_scope();

            let handler = match handler_type.activate(&scope).await {
                Ok(handler) => handler,
                Err(e) => {
                    warn!(
                        event_name,
                        handler = handler_type.short_name(),
                        error = %e,
                        "Handler not resolvable, skipping"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let event_type = match self.registry.event_type_by_name(event_name) {
                Ok(event_type) => event_type,
                Err(e) => {
                    warn!(event_name, error = %e, "Event type not found, skipping");
                    skipped += 1;
                    continue;
                }
            };

            let event = match event_type.decode(message.as_bytes()) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        event_name,
                        handler = handler_type.short_name(),
                        payload = message,
                        error = %e,
                        "Could not decode integration event"
                    );
                    skipped += 1;
                    continue;
                }
            };

            tokio::task::yield_now().await;
            invoked += 1;
            if let Err(e) = handler.handle_dynamic(event).await {
                failed += 1;
                error!(
                    event_name,
                    handler = handler_type.short_name(),
                    payload = message,
                    error = ?e,
                    "Integration event handler failed"
                );
            }
        }

        DispatchReport::Dispatched {
            invoked,
            failed,
            skipped,
        }
    }
}

/// Wait for a detached consumer to finish
///
/// A handler running on the consumer task returns instead; the loop sees the
/// stop signal once the current delivery is acknowledged.
async fn join_consumer(task: JoinHandle<()>) {
    if tokio::task::try_id() == Some(task.id()) {
        debug!("Consumer stopped from one of its own handlers");
        return;
    }
    if let Err(e) = task.await {
        if e.is_panic() {
            error!(error = %e, "Consumer task panicked");
        }
    }
}

async fn run_consumer(
    bus: Weak<BusInner>,
    queue: String,
    mut channel: Box<dyn BrokerChannel>,
    mut stream: DeliveryStream,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                let Some(inner) = bus.upgrade() else { break };
                inner.handle_delivery(delivery).await;
            }
            Some(Err(e)) => {
                warn!(queue = %queue, error = %e, "Consumer channel failed, recreating");
                match recreate(&bus, &queue, &mut stop).await {
                    Some((new_channel, new_stream)) => {
                        let _ = channel.close().await;
                        channel = new_channel;
                        stream = new_stream;
                    }
                    None => break,
                }
            }
            None => {
                warn!(queue = %queue, "Consumer stream ended, recreating");
                match recreate(&bus, &queue, &mut stop).await {
                    Some((new_channel, new_stream)) => {
                        let _ = channel.close().await;
                        channel = new_channel;
                        stream = new_stream;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = channel.close().await;
    debug!(queue = %queue, "Consumer stopped");
}

/// Open a replacement consumer channel, retrying until it works or the
/// consumer is stopped
async fn recreate(
    bus: &Weak<BusInner>,
    queue: &str,
    stop: &mut oneshot::Receiver<()>,
) -> Option<(Box<dyn BrokerChannel>, DeliveryStream)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let inner = bus.upgrade()?;
        if inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        inner.set_state(BusState::Recreating);

        match inner.open_consumer(queue).await {
            Ok(opened) => {
                inner.set_state(BusState::Ready);
                info!(queue, attempt, "Consumer channel recreated");
                return Some(opened);
            }
            Err(e) => {
                let delay = inner.config.retry.delay_for(attempt);
                warn!(queue, attempt, error = %e, "Could not recreate consumer channel");
                drop(inner);
                tokio::select! {
                    biased;
                    _ = &mut *stop => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory_broker::InMemoryBroker;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    async fn bus_on(broker: &InMemoryBroker, queue: &str) -> EventBusResult<EventBus> {
        let retry = RetryPolicy::new(1, Duration::ZERO);
        let connection = PersistentConnection::new(Arc::new(broker.connector()), retry);
        EventBus::create(
            connection,
            ServiceContainer::new(),
            EventBusConfig::new(queue).with_retry(retry),
        )
        .await
    }

    #[tokio::test]
    async fn test_blank_queue_name_fails_before_io() {
        let broker = InMemoryBroker::new();
        let err = bus_on(&broker, "  ").await.unwrap_err();
        assert!(matches!(err, EventBusError::InvalidQueueName(_)));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_create_declares_and_consumes() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "identity").await.unwrap();
        assert_eq!(bus.state(), BusState::Ready);
        assert_eq!(bus.queue_name().as_deref(), Some("identity"));
        assert_eq!(bus.exchange_name(), "cim_event_bus");
        assert!(broker.has_consumer("identity"));
    }

    #[tokio::test]
    async fn test_create_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let err = bus_on(&broker, "identity").await.unwrap_err();
        assert!(matches!(err, EventBusError::ConnectionUnavailable));
    }

    #[tokio::test]
    async fn test_fault_marker_is_a_dispatch_error() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "identity").await.unwrap();
        let err = bus
            .inner
            .process_delivery("OrderPlaced", br#"{"note":"throw-fake-exception"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::FaultInjected { .. }));

        let err = bus
            .inner
            .process_delivery("OrderPlaced", &[0xff, 0xfe])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidUtf8(_)));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, "identity").await.unwrap();
        bus.close().await;
        bus.close().await;

        assert_eq!(bus.state(), BusState::Closed);
        assert_eq!(bus.queue_name(), None);
        assert!(bus.registry().is_empty());
        assert!(!broker.has_consumer("identity"));
    }
}
