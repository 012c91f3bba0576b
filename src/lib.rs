// Copyright 2025 Cowboy AI, LLC.

//! # CIM Event Bus
//!
//! Durable publish/subscribe integration event bus for the Composable
//! Information Machine.
//!
//! Services publish integration events to a broker exchange, routed by event
//! name, and each service consumes its own durable queue. This crate provides:
//! - **Integration events**: immutable messages with a generated id and
//!   creation timestamp, routed by their simple type name
//! - **Subscription registry**: event name to handler type bookkeeping, with a
//!   registration table instead of runtime reflection
//! - **Persistent connection**: one shared broker connection with bounded
//!   exponential retry and automatic reconnection
//! - **Event bus**: publish, subscribe, unsubscribe and a consumer loop that
//!   resolves handlers from a dependency injection scope per delivery
//! - **Transports**: NATS JetStream and an in-memory broker
//!
//! ## Delivery semantics
//!
//! 1. **At least once**: publishes carry no deduplication key and are retried
//! 2. **Ack always**: a delivery is acknowledged after every handler has been
//!    attempted, even when handling failed; failed messages are not redelivered
//! 3. **Sequential handlers**: handlers for one delivery run in registration
//!    order before the acknowledgment
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use cim_event_bus::{
//!     EventBus, EventBusConfig, EventMetadata, InMemoryBroker, IntegrationEvent,
//!     IntegrationEventHandler, PersistentConnection, RetryPolicy, ServiceContainer,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct OrderPlaced {
//!     metadata: EventMetadata,
//!     order_id: String,
//! }
//!
//! impl IntegrationEvent for OrderPlaced {
//!     fn metadata(&self) -> &EventMetadata {
//!         &self.metadata
//!     }
//! }
//!
//! struct ReserveStock;
//!
//! #[async_trait]
//! impl IntegrationEventHandler<OrderPlaced> for ReserveStock {
//!     async fn handle(&self, event: OrderPlaced) -> anyhow::Result<()> {
//!         println!("reserving stock for {}", event.order_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let container = ServiceContainer::new();
//! container.register_instance(ReserveStock).await?;
//!
//! let broker = InMemoryBroker::new();
//! let connection = PersistentConnection::new(Arc::new(broker.connector()), RetryPolicy::default());
//! let bus = EventBus::create(connection, container, EventBusConfig::new("inventory")).await?;
//!
//! bus.subscribe::<OrderPlaced, ReserveStock>().await?;
//! bus.publish(&OrderPlaced {
//!     metadata: EventMetadata::new(),
//!     order_id: "abc123".to_string(),
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod bus;
pub mod codec;
mod config;
mod errors;
mod event_handler;
mod events;
pub mod infrastructure;
pub mod integration;
pub mod retry;
pub mod subscriptions;

pub use bus::{BusState, DispatchError, DispatchReport, EventBus, FAULT_INJECTION_MARKER};
pub use codec::CodecError;
pub use config::{EventBusConfig, DEFAULT_EXCHANGE_NAME};
pub use errors::{EventBusError, EventBusResult};
pub use event_handler::IntegrationEventHandler;
pub use events::{simple_type_name, EventMetadata, IntegrationEvent};
pub use infrastructure::{
    ConnectionError, ConnectionSignal, InMemoryBroker, NatsConfig, NatsConnector, NatsError,
    PersistentConnection, TransportError,
};
pub use integration::{ContainerBuilder, ContainerError, ServiceContainer, ServiceLifetime, ServiceScope};
pub use retry::{RetryPolicy, Transient};
pub use subscriptions::{
    EventNameRemoved, EventType, HandlerType, RegistryError, SubscriptionInfo,
    SubscriptionRegistry,
};
