// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer for the event bus
//!
//! This module contains the broker-facing concerns:
//! - the transport abstraction the bus is written against
//! - the self-healing shared connection
//! - NATS JetStream and in-memory transport adapters

pub mod in_memory_broker;
pub mod nats_client;
pub mod persistent_connection;
pub mod transport;

pub use in_memory_broker::{InMemoryBroker, InMemoryConnection, InMemoryConnector};
pub use nats_client::{NatsConfig, NatsConnection, NatsConnector, NatsError};
pub use persistent_connection::{ConnectionError, PersistentConnection};
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal, Delivery, DeliveryAcker,
    DeliveryStream, OutgoingMessage, PublishOutcome, TransportError,
};
