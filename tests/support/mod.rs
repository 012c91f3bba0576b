// Copyright 2025 Cowboy AI, LLC.

//! Shared fixtures for event bus integration tests

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cim_event_bus::{
    EventBus, EventBusConfig, EventMetadata, InMemoryBroker, IntegrationEvent,
    IntegrationEventHandler, PersistentConnection, RetryPolicy, ServiceContainer,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::subscriber::DefaultGuard;

pub const QUEUE: &str = "ordering";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub metadata: EventMetadata,
    pub order_id: String,
}

impl OrderPlaced {
    pub fn new(order_id: &str) -> Self {
        Self {
            metadata: EventMetadata::new(),
            order_id: order_id.to_string(),
        }
    }
}

impl IntegrationEvent for OrderPlaced {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderShipped {
    pub metadata: EventMetadata,
    pub order_id: String,
    pub carrier: Option<String>,
}

impl IntegrationEvent for OrderShipped {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Ordered record of handler invocations
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub struct ReserveStock {
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for ReserveStock {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        self.recorder.record(format!("ReserveStock:{}", event.order_id));
        Ok(())
    }
}

/// Records how many deliveries the broker had acknowledged when it ran
pub struct NotifyCustomer {
    pub recorder: Recorder,
    pub broker: InMemoryBroker,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for NotifyCustomer {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        self.recorder.record(format!(
            "NotifyCustomer:{}:acked={}",
            event.order_id,
            self.broker.acked_count()
        ));
        Ok(())
    }
}

pub struct RejectOrder {
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for RejectOrder {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        self.recorder.record(format!("RejectOrder:{}", event.order_id));
        anyhow::bail!("order {} rejected", event.order_id)
    }
}

pub struct TrackShipment {
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderShipped> for TrackShipment {
    async fn handle(&self, event: OrderShipped) -> anyhow::Result<()> {
        self.recorder.record(format!(
            "TrackShipment:{}:{}",
            event.order_id,
            event.carrier.unwrap_or_default()
        ));
        Ok(())
    }
}

/// Closes the bus it is subscribed on
pub struct CloseBus {
    pub bus: Arc<OnceLock<EventBus>>,
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for CloseBus {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        let bus = self.bus.get().context("bus not set")?;
        bus.close().await;
        self.recorder.record(format!("CloseBus:{}", event.order_id));
        Ok(())
    }
}

/// Drops its own subscription and subscribes shipment tracking instead
pub struct SwitchToTracking {
    pub bus: Arc<OnceLock<EventBus>>,
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for SwitchToTracking {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        let bus = self.bus.get().context("bus not set")?;
        bus.unsubscribe::<OrderPlaced, SwitchToTracking>();
        // Give the removal listener time to start tearing the consumer down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.subscribe::<OrderShipped, TrackShipment>().await?;
        self.recorder
            .record(format!("SwitchToTracking:{}", event.order_id));
        Ok(())
    }
}

/// Per-delivery state, registered as scoped
pub struct DeliveryContext {
    pub id: u32,
}

/// Transient service depending on the scoped [`DeliveryContext`]
pub struct AuditTrail {
    pub context: Arc<DeliveryContext>,
}

/// Records whether its dependencies share one delivery context
pub struct AuditOrder {
    pub trail: Arc<AuditTrail>,
    pub context: Arc<DeliveryContext>,
    pub recorder: Recorder,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for AuditOrder {
    async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
        self.recorder.record(format!(
            "AuditOrder:{}:context={}:shared={}",
            event.order_id,
            self.context.id,
            Arc::ptr_eq(&self.context, &self.trail.context)
        ));
        Ok(())
    }
}

/// Register [`AuditOrder`] with its scoped and transient dependencies
pub async fn register_audit(container: &ServiceContainer, recorder: &Recorder) {
    let contexts = Arc::new(AtomicU32::new(0));
    container
        .register_scoped(move |_| {
            let id = contexts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(DeliveryContext { id }) }.boxed()
        })
        .await
        .unwrap();
    container
        .register_transient(|scope| {
            async move {
                let context = scope.resolve::<DeliveryContext>().await?;
                Ok(AuditTrail { context })
            }
            .boxed()
        })
        .await
        .unwrap();
    let recorder = recorder.clone();
    container
        .register_transient(move |scope| {
            let recorder = recorder.clone();
            async move {
                Ok(AuditOrder {
                    trail: scope.resolve::<AuditTrail>().await?,
                    context: scope.resolve::<DeliveryContext>().await?,
                    recorder,
                })
            }
            .boxed()
        })
        .await
        .unwrap();
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO)
}

/// Transient registration for a service built from cloned test state
pub async fn register<T, F>(container: &ServiceContainer, build: F)
where
    T: Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    container
        .register_transient(move |_| {
            let service = build();
            async move { Ok(service) }.boxed()
        })
        .await
        .unwrap();
}

/// Container with every test handler registered as transient
pub async fn container(recorder: &Recorder, broker: &InMemoryBroker) -> ServiceContainer {
    let container = ServiceContainer::new();

    let r = recorder.clone();
    register(&container, move || ReserveStock { recorder: r.clone() }).await;

    let (r, b) = (recorder.clone(), broker.clone());
    register(&container, move || NotifyCustomer {
        recorder: r.clone(),
        broker: b.clone(),
    })
    .await;

    let r = recorder.clone();
    register(&container, move || RejectOrder { recorder: r.clone() }).await;

    let r = recorder.clone();
    register(&container, move || TrackShipment { recorder: r.clone() }).await;

    container
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub recorder: Recorder,
    pub bus: EventBus,
}

pub async fn harness() -> Harness {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let container = container(&recorder, &broker).await;
    let bus = bus_with(&broker, container).await;

    Harness {
        broker,
        recorder,
        bus,
    }
}

/// Bus on [`QUEUE`] resolving handlers from `container`
pub async fn bus_with(broker: &InMemoryBroker, container: ServiceContainer) -> EventBus {
    let connection = PersistentConnection::new(Arc::new(broker.connector()), quick_retry());
    EventBus::create(
        connection,
        container,
        EventBusConfig::new(QUEUE).with_retry(quick_retry()),
    )
    .await
    .unwrap()
}

/// Wait until `condition` holds, failing the test after five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

/// Formatted log output captured for the current thread
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    /// Install a capturing subscriber as the thread default
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let buffer = Arc::clone(&capture.0);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || CaptureWriter(Arc::clone(&buffer)))
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}
